fn main() {
    std::process::exit(magneto_rust_lib::run())
}
