mod cli;

use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let args = cli::CliArgs::parse();
    pixelmap::logger::set_echo(args.verbose);
    pixelmap::logger::init();
    cli::run(args)
}
