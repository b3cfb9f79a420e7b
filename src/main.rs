use clap::{Parser, ValueEnum};
use log::{error, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use synthxex::BuildOptions;
use synthxex::xex::header::{XEX_MOD_FLAG_DLL, XEX_MOD_FLAG_EXPORTS, XEX_MOD_FLAG_TITLE};

/// Builds an XEX2 container from an Xbox 360 PE executable.
#[derive(Debug, Parser)]
#[command(name = "synthxex", version, about, disable_version_flag = true)]
struct Args {
    /// Show version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Input PE file path
    #[arg(short, long, required_unless_present = "libs")]
    input: Option<PathBuf>,

    /// Output XEX file path
    #[arg(short, long, required_unless_present = "libs")]
    output: Option<PathBuf>,

    /// Skip the PE file machine ID check
    #[arg(short, long)]
    skip_machine_check: bool,

    /// Override automatic executable type detection
    #[arg(short = 't', long = "type", value_enum)]
    module_type: Option<ModuleType>,

    /// Show licensing information of libraries used
    #[arg(short, long)]
    libs: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModuleType {
    Title,
    Titledll,
    Sysdll,
    Dll,
}

impl ModuleType {
    fn module_flags(self) -> u32 {
        match self {
            ModuleType::Title => XEX_MOD_FLAG_TITLE,
            ModuleType::Titledll => XEX_MOD_FLAG_TITLE | XEX_MOD_FLAG_DLL,
            ModuleType::Sysdll => XEX_MOD_FLAG_EXPORTS | XEX_MOD_FLAG_DLL,
            ModuleType::Dll => XEX_MOD_FLAG_DLL,
        }
    }
}

fn display_libs() {
    println!("Libraries utilised by synthxex:\n");
    println!("scroll      (MIT)                  https://github.com/m4b/scroll");
    println!("sha1        (MIT OR Apache-2.0)    RustCrypto hashes");
    println!("log         (MIT OR Apache-2.0)    https://github.com/rust-lang/log");
    println!("env_logger  (MIT OR Apache-2.0)    https://github.com/rust-cli/env_logger");
    println!("clap        (MIT OR Apache-2.0)    https://github.com/clap-rs/clap");
    println!("\nSee each project for its full license text.");
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let args = Args::parse();

    if args.libs {
        display_libs();
        return ExitCode::SUCCESS;
    }

    if args.skip_machine_check {
        warn!("skipping machine ID check");
    }

    let opts = BuildOptions {
        skip_machine_check: args.skip_machine_check,
        module_flags: args.module_type.map(ModuleType::module_flags),
    };

    // clap enforces these when --libs is absent
    let (input, output) = match (&args.input, &args.output) {
        (Some(input), Some(output)) => (input, output),
        _ => unreachable!("clap requires input and output"),
    };

    match synthxex::synthesize(input, output, &opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}; aborting");
            ExitCode::FAILURE
        }
    }
}
