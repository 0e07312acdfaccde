use anyhow::Result;
use polyglot_lsp::Language;
use std::iter::Peekable;
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct Args {
    pub display_help: bool,
    pub display_version: bool,
    pub verbosity: u64,
    pub log_file: Option<PathBuf>,
    pub trace: bool,
    pub command: Option<Command>,
}

#[derive(Debug)]
pub enum Command {
    /// Install the server binary for a language into the static cache.
    Install { language: Language },
    /// One-shot definition query against a workspace.
    Definition {
        language: Language,
        workspace: PathBuf,
        file: PathBuf,
        line: u32,
        column: u32,
    },
}

impl Args {
    pub fn parse_args() -> Result<Args> {
        let mut argv = std::env::args().peekable();
        parse_args(&mut argv)
    }
}

pub fn parse_args(argv: &mut Peekable<impl Iterator<Item = String>>) -> Result<Args> {
    let mut args = Args::default();
    argv.next(); // skip the program, we don't care about that

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--version" => args.display_version = true,
            "--help" | "-h" => args.display_help = true,
            "--trace" => args.trace = true,
            "--log" => {
                args.log_file = argv.next().map(PathBuf::from);
                if args.log_file.is_none() {
                    anyhow::bail!("--log must be followed by a file path");
                }
            }
            arg if arg.starts_with("-v") => {
                let verbosity = arg.chars().skip(1).take_while(|c| *c == 'v').count();
                if verbosity + 1 != arg.len() {
                    anyhow::bail!("unknown flag '{arg}'");
                }
                args.verbosity = verbosity as u64;
            }
            "install" => {
                let language = next_language(argv)?;
                args.command = Some(Command::Install { language });
                break;
            }
            "definition" => {
                let language = next_language(argv)?;
                let workspace = PathBuf::from(next_value(argv, "a workspace root")?);
                let file = PathBuf::from(next_value(argv, "a workspace-relative file")?);
                let line = next_value(argv, "a zero-based line")?.parse()?;
                let column = next_value(argv, "a zero-based column")?.parse()?;
                args.command = Some(Command::Definition {
                    language,
                    workspace,
                    file,
                    line,
                    column,
                });
                break;
            }
            arg => anyhow::bail!("unknown argument '{arg}', see --help"),
        }
    }

    Ok(args)
}

fn next_value(argv: &mut Peekable<impl Iterator<Item = String>>, what: &str) -> Result<String> {
    argv.next()
        .ok_or_else(|| anyhow::anyhow!("expected {what}"))
}

fn next_language(argv: &mut Peekable<impl Iterator<Item = String>>) -> Result<Language> {
    next_value(argv, "a language tag")?.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        let mut argv = std::iter::once("polyglot".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .peekable();
        parse_args(&mut argv)
    }

    #[test]
    fn install_command() {
        let args = parse(&["install", "go"]).unwrap();
        assert!(matches!(
            args.command,
            Some(Command::Install {
                language: Language::Go
            })
        ));
    }

    #[test]
    fn definition_command_with_flags() {
        let args = parse(&[
            "-vv",
            "--trace",
            "definition",
            "typescript",
            "/work/repo",
            "src/router.ts",
            "194",
            "8",
        ])
        .unwrap();
        assert_eq!(args.verbosity, 2);
        assert!(args.trace);
        match args.command {
            Some(Command::Definition {
                language,
                line,
                column,
                ..
            }) => {
                assert_eq!(language, Language::TypeScript);
                assert_eq!((line, column), (194, 8));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_language_is_rejected() {
        assert!(parse(&["install", "cobol"]).is_err());
    }

    #[test]
    fn unknown_flag_is_rejected() {
        assert!(parse(&["--frobnicate"]).is_err());
    }
}
