use colored::*;
use kiln_core::{ErrorKind, ExecutionResult};

struct TestConfig {
    name: &'static str,
    code: &'static str,
    timeout_seconds: Option<u64>,
    expected_kind: ErrorKind,
    expected_output_contains: Option<&'static str>,
    expected_error_contains: Option<&'static str>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let port = std::env::var("KILN_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let url = format!("http://localhost:{}/api/v1/execute", port);

    let tests = vec![
        TestConfig {
            name: "Hello World",
            code: "print('hello')",
            timeout_seconds: None,
            expected_kind: ErrorKind::None,
            expected_output_contains: Some("hello"),
            expected_error_contains: None,
        },
        TestConfig {
            name: "Missing import is added",
            code: "print(math.sqrt(16))",
            timeout_seconds: None,
            expected_kind: ErrorKind::None,
            expected_output_contains: Some("4.0"),
            expected_error_contains: None,
        },
        TestConfig {
            name: "Undefined name",
            code: "print(undefined_name)",
            timeout_seconds: None,
            expected_kind: ErrorKind::ExecutionFailure,
            expected_output_contains: None,
            expected_error_contains: Some("NameError"),
        },
        TestConfig {
            name: "Syntax error",
            code: "print('Missing closing quote)",
            timeout_seconds: None,
            expected_kind: ErrorKind::ExecutionFailure,
            expected_output_contains: None,
            expected_error_contains: Some("SyntaxError"),
        },
        TestConfig {
            name: "Infinite loop",
            code: "while True:\n    pass",
            timeout_seconds: Some(3),
            expected_kind: ErrorKind::ExecutionTimeout,
            expected_output_contains: None,
            expected_error_contains: Some("timed out"),
        },
        TestConfig {
            name: "Network is disabled",
            code: "import urllib.request\nurllib.request.urlopen('http://example.com', timeout=3)",
            timeout_seconds: None,
            expected_kind: ErrorKind::ExecutionFailure,
            expected_output_contains: None,
            expected_error_contains: Some("URLError"),
        },
    ];

    let mut passed = 0;
    let total = tests.len();

    for test in tests {
        print!("{:<32}", test.name);
        let body = serde_json::json!({ "code": test.code, "timeout_seconds": test.timeout_seconds });
        let res = client.post(&url).json(&body).send().await?;
        let result: ExecutionResult = res.json().await?;

        let mut failures = Vec::new();
        if result.error_kind != test.expected_kind {
            failures.push(format!("kind {:?} != {:?}", result.error_kind, test.expected_kind));
        }
        if let Some(needle) = test.expected_output_contains {
            if !result.stdout.contains(needle) {
                failures.push(format!("stdout lacks {:?}", needle));
            }
        }
        if let Some(needle) = test.expected_error_contains {
            if !result.error.contains(needle) {
                failures.push(format!("error lacks {:?}: {}", needle, result.error));
            }
        }

        if failures.is_empty() {
            passed += 1;
            println!("{}", "PASS".green());
        } else {
            println!("{}", "FAIL".red());
            for failure in failures {
                println!("    {}", failure.yellow());
            }
        }
    }

    println!("\n{}/{} passed", passed, total);
    Ok(())
}
