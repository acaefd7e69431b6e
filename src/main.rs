fn main() {
    if let Err(err) = csv_sourced::run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
