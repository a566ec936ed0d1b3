fn main() {
    // Build metadata is stamped into every checkpoint written by the crate
    built::write_built_file().expect("Failed to generate build info");
}
