fn main() {
    catbench::cmdline();
}
