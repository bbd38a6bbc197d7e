use kiln_box::{Engine, RunOptions};
use kiln_core::{KilnConfig, NoopRegistry};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = KilnConfig::new()?;
    let engine = Engine::detect(config, Arc::new(NoopRegistry))?;

    println!("Running 'while True: pass' with a 3s limit (Expect timeout)...");
    let result = engine
        .execution()
        .run_with("while True:\n    pass\n", RunOptions::with_timeout(Duration::from_secs(3)))
        .await;

    println!("Result:\n{}", result);

    if result.timed_out && !result.success {
        println!("PASS: Execution timed out.");
    } else {
        println!("FAIL: Expected a timeout, got {:?}", result.error_kind);
    }

    Ok(())
}
