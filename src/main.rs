fn main() {
    circuit_pipeline::cli::run();
}
