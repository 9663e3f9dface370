use anyhow::Result;

fn main() -> Result<()> {
    ingestbench_runner::cli::execute()
}
