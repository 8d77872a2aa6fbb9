use std::env;

use chat_remote::{RestClient, RestClientConfig};

#[tokio::main]
async fn main() {
    let base_url =
        env::var("RAGCHAT_API_BASE_URL").unwrap_or_else(|_| "http://localhost:5000".to_owned());

    let client = match RestClient::new(RestClientConfig::new(base_url.clone())) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("Failed to build REST client: {err}");
            std::process::exit(1);
        }
    };

    let report = client.test_connection().await;
    if !report.success {
        eprintln!(
            "Backend at {base_url} unreachable: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
        std::process::exit(1);
    }
    println!(
        "Backend at {base_url} is {}.",
        report.status.as_deref().unwrap_or("reachable")
    );

    match client.create_session().await {
        Ok(session_id) => {
            println!("Created session {session_id}.");
            if let Err(err) = client.clear_session(&session_id).await {
                eprintln!("Failed to clear smoke session: {err}");
            }
            println!("Run ragchat-terminal for a live chat.");
        }
        Err(err) => {
            eprintln!("Failed to create session: {err}");
            std::process::exit(1);
        }
    }
}
