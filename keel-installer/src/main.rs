fn main() -> anyhow::Result<()> {
    keel_installer::run()
}
