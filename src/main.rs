use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use lys::bridge::container;
use lys::bridge::session::ScriptVm;
use lys::context::bridge_context;

fn usage() -> ExitCode {
    eprintln!("usage: lys run <script> [--path <dir>]...");
    eprintln!("       lys compile <script> [-o <out>] [--strip] [--compress]");
    ExitCode::from(2)
}

fn main() -> ExitCode {
    let mut args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        return usage();
    }
    let command = args.remove(0);
    match command.as_str() {
        "run" => run(args),
        "compile" => compile(args),
        _ => usage(),
    }
}

fn run(mut args: Vec<String>) -> ExitCode {
    let mut search_paths = Vec::new();
    while let Some(pos) = args.iter().position(|a| a == "--path") {
        args.remove(pos);
        if pos >= args.len() {
            return usage();
        }
        search_paths.push(PathBuf::from(args.remove(pos)));
    }
    let Some(script) = args.first() else {
        return usage();
    };
    if !search_paths.is_empty() {
        bridge_context().set_search_paths(search_paths);
    }

    let vm = match ScriptVm::thread_local() {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("lys: {}", err);
            return ExitCode::FAILURE;
        }
    };
    match vm.script_file(script) {
        Ok(result) => {
            if !result.is_nullish() {
                println!("{}", result);
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("lys: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn compile(mut args: Vec<String>) -> ExitCode {
    let strip = args.iter().any(|a| a == "--strip");
    args.retain(|a| a != "--strip");
    let compress = args.iter().any(|a| a == "--compress");
    args.retain(|a| a != "--compress");

    let mut out_path = None;
    if let Some(pos) = args.iter().position(|a| a == "-o") {
        args.remove(pos);
        if pos >= args.len() {
            return usage();
        }
        out_path = Some(PathBuf::from(args.remove(pos)));
    }
    let Some(script) = args.first().map(PathBuf::from) else {
        return usage();
    };
    let out_path = out_path.unwrap_or_else(|| script.with_extension("lsc"));

    let vm = match ScriptVm::thread_local() {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("lys: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let bytecode = match vm.compile_file(&script, strip) {
        Ok(bytecode) => bytecode,
        Err(err) => {
            eprintln!("lys: {}", err);
            return ExitCode::FAILURE;
        }
    };
    let packed = container::wrap(&bytecode, compress);
    if let Err(err) = fs::write(&out_path, packed) {
        eprintln!("lys: cannot write {}: {}", out_path.display(), err);
        return ExitCode::FAILURE;
    }
    println!("compiled {} -> {}", script.display(), out_path.display());
    ExitCode::SUCCESS
}
