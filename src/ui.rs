use dialoguer::console::style;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "CYRUS_LOCAL_LOG";

/// Diagnostics go to stderr through `tracing`; `verbose` forces debug level.
pub fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("cyrus_local=debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Human-facing progress output. Silenced in `--json` mode so stdout stays parseable.
#[derive(Debug, Clone, Copy)]
pub struct Ui {
    quiet: bool,
}

impl Ui {
    pub fn new(json: bool) -> Self {
        Self { quiet: json }
    }

    pub fn step(&self, message: &str) {
        if !self.quiet {
            println!("{} {}", style("==>").bold().cyan(), style(message).bold());
        }
    }

    pub fn info(&self, message: &str) {
        if !self.quiet {
            println!("    {message}");
        }
    }

    pub fn success(&self, message: &str) {
        if !self.quiet {
            println!("{} {}", style("✓").green().bold(), message);
        }
    }

    pub fn warn(&self, message: &str) {
        if !self.quiet {
            eprintln!("{} {}", style("warning:").yellow().bold(), message);
        }
    }

    pub fn error(&self, message: &str) {
        eprintln!("{} {}", style("error:").red().bold(), message);
    }

    pub fn hint(&self, message: &str) {
        if !self.quiet {
            println!("    {}", style(message).dim());
        }
    }
}
