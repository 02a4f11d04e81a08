/// Generate a fixed proxy struct for a remote object type.
///
/// ```ignore
/// msgprims_rpc::rpc_interface! {
///     /// Remote echo service.
///     pub struct EchoProxy: "echo" { echo, ping }
/// }
///
/// let echo = EchoProxy::bind(&client, "target-id")?;
/// let reply = echo.ping(Message::empty()).await?;
/// ```
///
/// `bind` declares the type on the client (idempotent) and returns a proxy
/// with one async method per declared name.
#[macro_export]
macro_rules! rpc_interface {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident : $type_name:literal { $($method:ident),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        $vis struct $name {
            remote: $crate::RemoteObject,
        }

        impl $name {
            pub const TYPE_NAME: &'static str = $type_name;
            pub const METHODS: &'static [&'static str] = &[$(stringify!($method)),+];

            /// Declare this type on `client` and return a proxy for `target`.
            pub fn bind(
                client: &$crate::RpcClient,
                target: impl Into<String>,
            ) -> $crate::Result<Self> {
                client.register_type(Self::TYPE_NAME, Self::METHODS.iter().copied())?;
                Ok(Self {
                    remote: client.get(target, Self::TYPE_NAME)?,
                })
            }

            /// Wrap an existing proxy. Fails if it lacks any declared method.
            pub fn from_remote(remote: $crate::RemoteObject) -> $crate::Result<Self> {
                for method in Self::METHODS {
                    if !remote.has_method(method) {
                        return Err($crate::RpcError::UndeclaredMethod {
                            type_name: remote.type_name().to_string(),
                            method: (*method).to_string(),
                        });
                    }
                }
                Ok(Self { remote })
            }

            pub fn remote(&self) -> &$crate::RemoteObject {
                &self.remote
            }

            $(
                pub async fn $method(
                    &self,
                    message: impl Into<$crate::Message>,
                ) -> $crate::Result<$crate::Message> {
                    self.remote.call(stringify!($method), message.into()).await
                }
            )+
        }
    };
}
