#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() {
    let exit_code = match keel::run::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("keel: error: {:#}", err);
            keel::run::error_code(&err)
        }
    };
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}
