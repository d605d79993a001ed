use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use usmkit::cli::{
    create_container, extract_container, show_info, CreateOptions, ExtractOptions,
};
use usmkit::config::ToolPaths;
use usmkit::{parse_key, DEFAULT_KEY};

/// Version info from build.rs
const VERSION: &str = env!("USMKIT_VERSION");
const PROFILE: &str = env!("USMKIT_PROFILE");
const GIT_HASH: &str = env!("USMKIT_GIT_HASH");

fn get_version() -> &'static str {
    use std::sync::OnceLock;
    static VERSION_STRING: OnceLock<String> = OnceLock::new();
    VERSION_STRING.get_or_init(|| format!("{} {} ({})", PROFILE, VERSION, GIT_HASH))
}

#[derive(Parser)]
#[command(name = "usmkit")]
#[command(author, about = "Mux and demux CRI USM video containers", long_about = None)]
struct Cli {
    /// Print version
    #[arg(short = 'V', long)]
    version: bool,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack a VP9 (IVF) or H264 video into a USM container
    #[command(alias = "c")]
    Create {
        /// Source video
        source: PathBuf,

        /// Output container (defaults to the source with a .usm extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Key seed as hex, 0x prefix optional
        #[arg(long, value_parser = parse_key_arg)]
        key: Option<u64>,

        /// Path to ffprobe
        #[arg(long)]
        ffprobe: Option<PathBuf>,

        /// Path to ffmpeg
        #[arg(long)]
        ffmpeg: Option<PathBuf>,
    },

    /// Split a USM container into elementary streams
    #[command(alias = "x")]
    Extract {
        /// USM container
        source: PathBuf,

        /// Directory receiving videos/ and audios/
        output_dir: PathBuf,

        /// Key seed as hex, 0x prefix optional
        #[arg(long, value_parser = parse_key_arg)]
        key: Option<u64>,
    },

    /// Show the chunk layout of a USM container
    #[command(alias = "i")]
    Info {
        /// USM container to inspect
        file: PathBuf,
    },
}

fn parse_key_arg(s: &str) -> Result<u64, String> {
    parse_key(s).map_err(|e| format!("{}", e))
}

fn init_tracing(verbose: bool) {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if verbose {
            "usmkit=debug".to_string()
        } else {
            "usmkit=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.version {
        println!("usmkit {}", get_version());
        return ExitCode::SUCCESS;
    }

    let command = match cli.command {
        Some(cmd) => cmd,
        None => {
            use clap::CommandFactory;
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
            println!();
            return ExitCode::SUCCESS;
        }
    };

    init_tracing(cli.verbose);

    let result = match command {
        Commands::Create {
            source,
            output,
            key,
            ffprobe,
            ffmpeg,
        } => {
            let options = CreateOptions {
                key: key.unwrap_or(DEFAULT_KEY),
                output,
                tools: ToolPaths { ffprobe, ffmpeg },
            };

            create_container(&source, &options).map(|path| {
                println!("Created {}", path.display());
            })
        }

        Commands::Extract {
            source,
            output_dir,
            key,
        } => {
            let options = ExtractOptions {
                key: key.unwrap_or(DEFAULT_KEY),
            };

            extract_container(&source, &output_dir, &options).map(|summary| {
                for path in summary.videos.iter().chain(&summary.audios) {
                    println!("Extracted {}", path.display());
                }
            })
        }

        Commands::Info { file } => show_info(&file).map(|info| print!("{}", info)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
