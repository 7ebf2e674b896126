fn main() {
    warden_kernel::cli::init_tracing();
    let code = warden_kernel::cli::run(std::env::args().skip(1));
    std::process::exit(code);
}
