//! Child-process worker: speaks the bridge protocol on stdin/stdout.

use xpy_calc::CalcEngine;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    xpy::serve_stdio(CalcEngine::new()).await?;
    Ok(())
}
