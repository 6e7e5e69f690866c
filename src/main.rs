fn main() {
    repofleet::cli::run();
}
