use anyhow::Result;

fn main() -> Result<()> {
    tm_search::run()
}
