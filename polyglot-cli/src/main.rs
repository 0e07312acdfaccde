mod args;
mod log;

use anyhow::{Context, Result};
use args::{Args, Command};
use polyglot_lsp::{install, languages, ClientConfig, SyncSession};

const USAGE: &str = "\
polyglot - multi-language LSP client

USAGE:
    polyglot [FLAGS] install <language>
    polyglot [FLAGS] definition <language> <workspace> <file> <line> <column>

FLAGS:
    -v...        Increase logging verbosity (warn, info, debug, trace)
    --trace      Mirror every LSP payload to the log
    --log <file> Write the log to a file instead of stderr
    --help       Print this help
    --version    Print the version

Supported language tags: csharp, python, rust, java, kotlin, typescript,
javascript, go, ruby, dart, cpp, clojure, php, perl, elixir (a compiled-in
server profile currently exists for go, typescript, javascript, rust,
python and ruby).
";

fn main() {
    match run() {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse_args()?;

    if args.display_version {
        println!("polyglot {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if args.display_help || args.command.is_none() {
        print!("{USAGE}");
        return Ok(());
    }

    // wire dumps are logged at info; --trace alone must be enough to see them
    let verbosity = if args.trace {
        args.verbosity.max(1)
    } else {
        args.verbosity
    };
    match args.log_file {
        Some(ref path) => {
            let file = fern::log_file(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            log::setup_logging(file, verbosity)?
        }
        None => log::setup_logging(std::io::stderr(), verbosity)?,
    };

    match args.command.expect("checked above") {
        Command::Install { language } => {
            let profile = languages::profile(language)?;
            let binary = install::ensure_installed(profile.as_ref())?;
            println!("{} installed at {}", profile.name(), binary.display());
        }
        Command::Definition {
            language,
            workspace,
            file,
            line,
            column,
        } => {
            let mut config = ClientConfig::new(language);
            config.trace_lsp_communication = args.trace;

            let sync = SyncSession::create(config, &workspace)?;
            let server = sync.start_server()?;
            let targets = sync.request_definition(&file, line, column)?;
            serde_json::to_writer_pretty(std::io::stdout().lock(), &targets)?;
            println!();
            server.stop()?;
        }
    }

    Ok(())
}
