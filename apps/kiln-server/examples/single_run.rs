use kiln_core::ExecutionResult;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let client = reqwest::Client::new();

    let body = serde_json::json!({
        "code": "print('Hello from Single Run')",
        "timeout_seconds": 10,
    });

    println!("Submitting Single Run...");
    let port = std::env::var("KILN_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let url = format!("http://localhost:{}/api/v1/execute", port);
    let res = client.post(&url).json(&body).send().await?;

    if !res.status().is_success() {
        eprintln!("Error: {}", res.text().await?);
        return Ok(());
    }

    let result: ExecutionResult = res.json().await?;
    println!("Success: {}", result.success);
    println!("Stdout: {}", result.stdout);
    println!("Error: {}", result.error);
    println!("Time: {:.2} ms", result.execution_time_ms);

    Ok(())
}
