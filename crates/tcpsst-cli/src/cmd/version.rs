use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    println!("tcpsst {}", env!("CARGO_PKG_VERSION"));
    if args.extended {
        println!("protocol version 1");
        println!("default width {}", tcpsst::DEFAULT_WIDTH);
        println!("max width {}", tcpsst::MAX_WIDTH);
    }
    Ok(SUCCESS)
}
