use kiln_box::Engine;
use kiln_core::{KilnConfig, NoopRegistry};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = KilnConfig::new()?;
    let engine = Engine::detect(config, Arc::new(NoopRegistry))?;

    println!("Running print(math.sqrt(16)) without importing math...");
    let result = engine.execution().run("print(math.sqrt(16))\n").await;

    println!("Result:\n{}", result);
    Ok(())
}
