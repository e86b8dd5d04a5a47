//! Command-line interface.
//!
//! A flat match loop over the argument list, no parser library: this tool
//! has a handful of flags and no compatibility burden. Unknown flags are
//! errors.

use super::{Driver, Language};
use crate::vm::sink::StdioSink;

const USAGE: &str = "usage: helix [options] [file]
options:
  -e <source>   use <source> as the program text instead of a file
  -x <lang>     input language: c or asm (default: from file extension)
  -S            stop after the C front end; print assembly
  -c            stop after linking; write the ELF image (see -o)
  -o <path>     output path for -c (default: a.out)
  --json        print the run outcome as JSON on stdout after the run
  -v, --verbose trace pipeline phases on stderr
  --version     print version and exit";

struct CliOptions {
    input_path: Option<String>,
    inline_source: Option<String>,
    language: Option<Language>,
    stop_after_assembly: bool,
    stop_after_link: bool,
    output_path: String,
    json: bool,
    verbose: bool,
}

/// Entry point for the binary. Returns the process exit code: the guest's
/// on success, 1 on any host-side failure.
pub fn run_cli(args: &[String]) -> Result<i32, String> {
    let mut opts = CliOptions {
        input_path: None,
        inline_source: None,
        language: None,
        stop_after_assembly: false,
        stop_after_link: false,
        output_path: "a.out".to_string(),
        json: false,
        verbose: false,
    };

    let mut i = 1;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-e" => {
                i += 1;
                opts.inline_source =
                    Some(args.get(i).ok_or("-e requires an argument")?.clone());
            }
            "-x" => {
                i += 1;
                let lang = args.get(i).ok_or("-x requires an argument")?;
                opts.language = Some(lang.parse()?);
            }
            "-S" => opts.stop_after_assembly = true,
            "-c" => opts.stop_after_link = true,
            "-o" => {
                i += 1;
                opts.output_path = args.get(i).ok_or("-o requires an argument")?.clone();
            }
            "--json" => opts.json = true,
            "-v" | "--verbose" => opts.verbose = true,
            "--version" => {
                println!("helix {}", env!("CARGO_PKG_VERSION"));
                return Ok(0);
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                return Ok(0);
            }
            _ if arg.starts_with('-') => {
                return Err(format!("unknown flag '{}'\n{}", arg, USAGE));
            }
            _ => {
                if opts.input_path.is_some() {
                    return Err("more than one input file".to_string());
                }
                opts.input_path = Some(arg.to_string());
            }
        }
        i += 1;
    }

    let source = match (&opts.inline_source, &opts.input_path) {
        (Some(src), _) => src.clone(),
        (None, Some(path)) => {
            std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path, e))?
        }
        (None, None) => return Err(format!("no input\n{}", USAGE)),
    };

    let language = opts.language.unwrap_or_else(|| infer_language(&opts));

    let mut driver = Driver::new();
    driver.verbose = opts.verbose;

    if opts.stop_after_assembly {
        if language != Language::C {
            return Err("-S only applies to C input".to_string());
        }
        let (assembly, _) = driver.compile(&source).map_err(|e| e.to_string())?;
        print!("{}", assembly);
        return Ok(0);
    }

    if opts.stop_after_link {
        let program = driver.build(language, &source).map_err(|e| e.to_string())?;
        std::fs::write(&opts.output_path, &program.image.bytes)
            .map_err(|e| format!("{}: {}", opts.output_path, e))?;
        return Ok(0);
    }

    let mut sink = StdioSink;
    let outcome = driver
        .run(language, &source, &mut sink)
        .map_err(|e| e.to_string())?;

    if opts.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome).map_err(|e| e.to_string())?
        );
    } else if opts.verbose {
        eprintln!(
            "helix: exit {} after {} instructions in {} ms",
            outcome.exit_code, outcome.instruction_count, outcome.wall_ms
        );
    }

    Ok(outcome.exit_code as i32)
}

fn infer_language(opts: &CliOptions) -> Language {
    let Some(path) = &opts.input_path else {
        return Language::C;
    };
    match path.rsplit('.').next() {
        Some("s") | Some("S") | Some("asm") => Language::Asm,
        _ => Language::C,
    }
}
