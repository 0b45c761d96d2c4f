fn main() {
    if let Err(err) = divid::run_entry() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
