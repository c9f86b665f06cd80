use std::error::Error;

use secrecy::SecretString;
use tracing_subscriber::EnvFilter;
use xapi_sdk::{AccountType, XapiClient};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let user_id = "REPLACE_WITH_USER_ID";
    let password = SecretString::new("REPLACE_WITH_PASSWORD".to_string());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = XapiClient::new(AccountType::Demo);
        let session = client.connect_command().await?;

        println!("server_time_ms={}", session.get_server_time().await?);
        println!("version={}", session.get_version().await?);

        let stream_session_id = session.login(user_id, &password, Some("demo")).await?;
        println!("logged in: {stream_session_id:?}");

        session.close().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
