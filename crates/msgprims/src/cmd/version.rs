use msgprims_manager::PROTOCOL_VERSION;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("msgprims {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: msgprims");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("manager_protocol: {PROTOCOL_VERSION}");
    println!(
        "build_target: {}",
        option_env!("MSGPRIMS_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "features: mux={}, manager={}, cli=true",
        cfg!(feature = "mux"),
        cfg!(feature = "manager")
    );

    Ok(SUCCESS)
}
