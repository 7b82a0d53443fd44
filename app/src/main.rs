fn main() {
    if let Err(err) = dv_node::run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}
