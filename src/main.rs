fn main() {
    helixcore::cli_main();
}
