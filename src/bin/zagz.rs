/// zagz – gzip-style file tool over the accelerator-dispatch library.
///
///   zagz file.txt        → compress to file.txt.gz (removes original)
///   zagz -d file.txt.gz  → decompress to file.txt (removes original)
///   zagz -k file.txt     → keep the original
use std::env;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use zlib_accel::{lifecycle, GzFile, Status};

const CHUNK: usize = 256 * 1024;

fn usage() {
    eprintln!("zagz - gzip file compression with transparent accelerator dispatch");
    eprintln!();
    eprintln!("Usage: zagz [OPTIONS] FILE...");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -d, --decompress   Decompress .gz files");
    eprintln!("  -k, --keep         Keep original files");
    eprintln!("  -f, --force        Overwrite existing output files");
    eprintln!("  -h, --help         Show this help");
}

struct Opts {
    decompress: bool,
    keep: bool,
    force: bool,
    files: Vec<String>,
}

fn parse_args() -> Result<Opts, ExitCode> {
    let mut opts = Opts {
        decompress: false,
        keep: false,
        force: false,
        files: Vec::new(),
    };
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "-d" | "--decompress" => opts.decompress = true,
            "-k" | "--keep" => opts.keep = true,
            "-f" | "--force" => opts.force = true,
            "-h" | "--help" => {
                usage();
                return Err(ExitCode::SUCCESS);
            }
            other if other.starts_with('-') => {
                eprintln!("zagz: unknown option '{other}'");
                return Err(ExitCode::FAILURE);
            }
            file => opts.files.push(file.to_owned()),
        }
    }
    if opts.files.is_empty() {
        usage();
        return Err(ExitCode::FAILURE);
    }
    Ok(opts)
}

fn output_path(input: &Path, decompress: bool) -> Option<PathBuf> {
    if decompress {
        match input.extension() {
            Some(ext) if ext == "gz" => Some(input.with_extension("")),
            _ => {
                eprintln!("zagz: {}: unknown suffix, skipping", input.display());
                None
            }
        }
    } else {
        let mut name = input.as_os_str().to_owned();
        name.push(".gz");
        Some(PathBuf::from(name))
    }
}

fn compress_file(input: &Path, output: &Path, force: bool) -> bool {
    let mode = if force { "wb" } else { "wbx" };
    let out = match GzFile::open(output, mode) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("zagz: {}: {err}", output.display());
            return false;
        }
    };
    let mut src = match fs::File::open(input) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("zagz: {}: {err}", input.display());
            return false;
        }
    };

    let mut buf = vec![0_u8; CHUNK];
    loop {
        let read = match src.read(&mut buf) {
            Ok(read) => read,
            Err(err) => {
                eprintln!("zagz: {}: {err}", input.display());
                return false;
            }
        };
        if read == 0 {
            break;
        }
        if out.write(&buf[..read]) != read {
            eprintln!("zagz: {}: write failed", output.display());
            return false;
        }
    }
    out.close() == Status::Ok
}

fn decompress_file(input: &Path, output: &Path, force: bool) -> bool {
    if !force && output.exists() {
        eprintln!("zagz: {}: already exists", output.display());
        return false;
    }
    let src = match GzFile::open(input, "rb") {
        Ok(file) => file,
        Err(err) => {
            eprintln!("zagz: {}: {err}", input.display());
            return false;
        }
    };

    let mut data = Vec::new();
    let mut buf = vec![0_u8; CHUNK];
    loop {
        let got = src.read(&mut buf);
        if got < 0 {
            eprintln!("zagz: {}: read failed", input.display());
            return false;
        }
        if got == 0 {
            break;
        }
        data.extend_from_slice(&buf[..got as usize]);
    }
    if src.close() != Status::Ok {
        eprintln!("zagz: {}: close failed", input.display());
        return false;
    }
    if let Err(err) = fs::write(output, &data) {
        eprintln!("zagz: {}: {err}", output.display());
        return false;
    }
    true
}

fn main() -> ExitCode {
    let opts = match parse_args() {
        Ok(opts) => opts,
        Err(code) => return code,
    };

    let mut failed = false;
    for file in &opts.files {
        let input = Path::new(file);
        let Some(output) = output_path(input, opts.decompress) else {
            failed = true;
            continue;
        };
        let done = if opts.decompress {
            decompress_file(input, &output, opts.force)
        } else {
            compress_file(input, &output, opts.force)
        };
        if done {
            if !opts.keep {
                if let Err(err) = fs::remove_file(input) {
                    eprintln!("zagz: {}: {err}", input.display());
                    failed = true;
                }
            }
        } else {
            failed = true;
        }
    }

    lifecycle::shutdown();
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
