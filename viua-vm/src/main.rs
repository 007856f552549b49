use std::path::PathBuf;
use std::process::ExitCode;

use viua_vm::loader::Module;
use viua_vm::{Config, Kernel};

fn main() -> ExitCode {
    viua_vm::logging::init();

    let mut args = std::env::args_os().skip(1);
    let (Some(binary), None) = (args.next(), args.next()) else {
        eprintln!("usage: viua-vm <executable>");
        return ExitCode::FAILURE;
    };

    let path = PathBuf::from(binary);
    let module = match Module::load_file(&path) {
        Ok(module) => module,
        Err(e) => {
            eprintln!("viua-vm: cannot load {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    };

    let kernel = Kernel::new(Config::from_env());
    match kernel.run_binary(module) {
        0 => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
