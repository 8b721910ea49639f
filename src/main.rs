use clap::{Parser, Subcommand};
use proxy_cropper::imaging::RustBackend;
use proxy_cropper::pipeline::Pipeline;
use proxy_cropper::{config, output};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "proxy-cropper")]
#[command(about = "Crop card scans to print size, keeping outputs in sync with the sources")]
#[command(long_about = "\
Crop card scans to print size, keeping outputs in sync with the sources

A project directory holds the card sources and everything derived from them:

  project/
  ├── project.json                 # Card list, counts and per-card overrides
  ├── config.toml                  # Optional, see 'proxy-cropper gen-config'
  ├── fallback.png                 # Optional preview shown until one is ready
  └── images/                      # Sources: every png/jpg/bmp/gif is a card
      ├── forest.png
      ├── __back.png               # Leading '__' = hidden, count 0
      ├── uncrop/                  # Sources given a synthesized bleed edge
      └── crop/                    # Cropped outputs
          ├── .image.db            # Content-hash cache of what was produced
          ├── preview.cache        # Thumbnails
          ├── forest.png           # Bleed 0
          └── <cube>/1p50/         # Color cube and bleed variants

Only cards whose source or settings changed are processed again.")]
#[command(version)]
struct Cli {
    /// Project directory
    #[arg(long, default_value = ".", global = true)]
    project: PathBuf,

    /// More logging (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bring every crop and preview up to date, then exit
    Crop {
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
    },
    /// Keep outputs in sync with the image directory until stdin closes
    Watch,
    /// Print a stock config.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Crop { timeout } => {
            let config = config::load_config(&cli.project)?;
            let (tx, rx) = crossbeam_channel::unbounded();
            let printer = std::thread::spawn(move || {
                for event in rx {
                    output::print_event(&event);
                }
            });

            println!("==> Opening {}", cli.project.display());
            let pipeline = Pipeline::open(&cli.project, config, Arc::new(RustBackend::new()), Some(tx))?;
            pipeline.start()?;
            let idle = pipeline.wait_until_idle(Duration::from_secs(timeout));
            let summary = output::format_project_summary(&pipeline.project());
            pipeline.shutdown()?;
            printer.join().map_err(|_| "event printer panicked")?;

            println!();
            for line in summary {
                println!("{}", line);
            }
            if !idle {
                return Err(format!("work still pending after {timeout}s").into());
            }
        }
        Command::Watch => {
            let config = config::load_config(&cli.project)?;
            let (tx, rx) = crossbeam_channel::unbounded();
            let printer = std::thread::spawn(move || {
                for event in rx {
                    output::print_event(&event);
                }
            });

            println!("==> Watching {} (close stdin to stop)", cli.project.display());
            let pipeline = Pipeline::open(&cli.project, config, Arc::new(RustBackend::new()), Some(tx))?;
            pipeline.start()?;
            let mut sink = Vec::new();
            std::io::stdin().read_to_end(&mut sink)?;

            pipeline.shutdown()?;
            printer.join().map_err(|_| "event printer panicked")?;
            println!("==> Stopped");
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// Install the fmt subscriber. `-v` raises this crate to debug, `-vv` to
/// trace; directives from `RUST_LOG` still apply to everything else.
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = format!("proxy_cropper={level}").parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}
