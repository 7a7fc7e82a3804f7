use std::path::PathBuf;

use comments_engine::RunOptions;

enum Flags {
    Exit,
    Run(RunOptions),
}

fn main() {
    let options = match parse_cli_flags(std::env::args().skip(1)) {
        Ok(Flags::Exit) => return,
        Ok(Flags::Run(options)) => options,
        Err(message) => {
            eprintln!("error: {message}");
            std::process::exit(2);
        }
    };

    if let Err(err) = comments_engine::run(options) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn parse_cli_flags(args: impl Iterator<Item = String>) -> Result<Flags, String> {
    let mut options = RunOptions::default();
    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("comments-engine {}", comments_engine::VERSION);
                return Ok(Flags::Exit);
            }
            "--help" | "-h" => {
                println!(
                    "comments-engine - print a post's comment thread.\n\n  --offline            Use the built-in demo thread instead of the members API\n  --pages N            Number of comment pages to load (default 1)\n  --post ID            Post to load, overrides site.post_id\n  --config PATH        Config file, defaults to the user config dir\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message"
                );
                return Ok(Flags::Exit);
            }
            "--offline" => options.offline = true,
            "--pages" => {
                let value = args.next().ok_or("--pages needs a value")?;
                options.pages = value
                    .parse()
                    .map_err(|_| format!("invalid page count {value:?}"))?;
            }
            "--post" => {
                options.post_id = Some(args.next().ok_or("--post needs a value")?);
            }
            "--config" => {
                options.config_file = Some(PathBuf::from(
                    args.next().ok_or("--config needs a value")?,
                ));
            }
            other => return Err(format!("unknown argument {other:?}")),
        }
    }
    Ok(Flags::Run(options))
}
