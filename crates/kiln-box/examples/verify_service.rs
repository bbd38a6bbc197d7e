use kiln_box::Engine;
use kiln_core::{KilnConfig, NoopRegistry, ServiceMetadata, ServiceStatus};
use std::sync::Arc;

const CODE: &str = r#"
@endpoint("/add", "POST", "Adds two numbers")
def add(a: int, b: int):
    return {"sum": a + b}
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = KilnConfig::new()?;
    let engine = Engine::detect(config, Arc::new(NoopRegistry))?;
    let mut service = engine.service().await?;

    println!("Building and starting the adder service...");
    let metadata = ServiceMetadata {
        name: "Adder".to_string(),
        ..ServiceMetadata::default()
    };
    let handle = service.build_and_run(CODE, metadata).await;
    println!("Handle: {:?}", handle);

    if handle.status == ServiceStatus::Running {
        let docs = service.get_api_docs().await?;
        println!("Docs: {:?}", docs);

        let response: serde_json::Value = reqwest::Client::new()
            .post(format!("{}/add", handle.base_url))
            .json(&serde_json::json!({ "a": 2, "b": 3 }))
            .send()
            .await?
            .json()
            .await?;

        if response["sum"] == 5 {
            println!("PASS: /add returned {}", response);
        } else {
            println!("FAIL: unexpected response {}", response);
        }
    } else {
        println!("FAIL: service status {:?}: {:?}", handle.status, handle.error);
    }

    service.cleanup().await;
    Ok(())
}
