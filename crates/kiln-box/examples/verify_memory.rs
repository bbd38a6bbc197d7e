use kiln_box::Engine;
use kiln_core::{KilnConfig, NoopRegistry};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = KilnConfig::new()?;
    config.sandbox.memory_limit_mb = 64;
    let engine = Engine::detect(config, Arc::new(NoopRegistry))?;

    println!("Allocating ~512 MB under a 64 MB limit (Expect failure)...");
    let result = engine
        .execution()
        .run("blocks = [bytearray(1024 * 1024) for _ in range(512)]\nprint(len(blocks))\n")
        .await;

    println!("Result:\n{}", result);

    if !result.success {
        println!("PASS: Memory limit enforced ({:?}).", result.error_kind);
    } else {
        println!("FAIL: Allocation succeeded under the memory limit.");
    }

    Ok(())
}
