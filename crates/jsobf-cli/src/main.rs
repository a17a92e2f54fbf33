use std::{env, fs, process::ExitCode, time::Instant};

use jsobf::{Node, Obfuscator, Options};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let file_path = if args.len() > 1 { &args[1] } else { "example.ast.json" };
    let seed = args.get(2).and_then(|s| s.parse::<u64>().ok()).unwrap_or(0);

    let source = match read_file(file_path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut tree: Node = match serde_json::from_str(&source) {
        Ok(tree) => tree,
        Err(err) => {
            eprintln!("error: could not parse {file_path} as an AST document: {err}");
            return ExitCode::FAILURE;
        }
    };

    let options = match read_options(&args) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let start = Instant::now();
    let mut obfuscator = Obfuscator::new(options, seed);
    if let Err(err) = obfuscator.apply(&mut tree) {
        let elapsed = start.elapsed();
        eprintln!("error after: {elapsed:?}\n{err}");
        return ExitCode::FAILURE;
    }
    let elapsed = start.elapsed();

    match serde_json::to_string(&tree) {
        Ok(json) => {
            println!("{json}");
            eprintln!("success after: {elapsed:?}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: could not serialize obfuscated tree: {err}");
            ExitCode::FAILURE
        }
    }
}

/// A third `argv` entry names a JSON options document; its absence means
/// every pass stays disabled, matching [`Options::default`].
fn read_options(args: &[String]) -> Result<Options, String> {
    let Some(options_path) = args.get(3) else {
        return Ok(Options::default());
    };
    let raw = read_file(options_path)?;
    serde_json::from_str(&raw).map_err(|err| format!("could not parse {options_path} as an options document: {err}"))
}

fn read_file(file_path: &str) -> Result<String, String> {
    eprintln!("Reading file: {file_path}");
    match fs::metadata(file_path) {
        Ok(metadata) => {
            if !metadata.is_file() {
                return Err(format!("Error: {file_path} is not a file"));
            }
        }
        Err(err) => {
            return Err(format!("Error reading {file_path}: {err}"));
        }
    }
    match fs::read_to_string(file_path) {
        Ok(contents) => Ok(contents),
        Err(err) => Err(format!("Error reading file: {err}")),
    }
}
