fn main() {
    if let Err(err) = toolbridge::cli::main() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
