use std::error::Error;

use secrecy::SecretString;
use tracing_subscriber::EnvFilter;
use xapi_sdk::{AccountType, ChannelKey, SessionEvent, XapiClient};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let user_id = "REPLACE_WITH_USER_ID";
    let password = SecretString::new("REPLACE_WITH_PASSWORD".to_string());
    let symbol = "EURUSD";

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = XapiClient::new(AccountType::Demo);
        let command = client.connect_command().await?;
        let stream_session_id = command.login(user_id, &password, None).await?;

        let stream = client.connect_stream_with(stream_session_id).await?;
        let mut lifecycle = stream.events();
        let mut ticks = stream.listen(ChannelKey::tick_prices(symbol));
        stream.subscribe_tick_prices(symbol, Some(1_000), None).await?;

        for _ in 0..10 {
            tokio::select! {
                tick = ticks.recv() => {
                    let Some(tick) = tick else { break };
                    println!("{symbol} ask={} bid={}", tick.data["ask"], tick.data["bid"]);
                }
                event = lifecycle.recv() => {
                    if let Ok(SessionEvent::Close | SessionEvent::Error(_)) = event {
                        println!("stream ended: {event:?}");
                        break;
                    }
                }
            }
        }

        stream.unsubscribe(&ChannelKey::tick_prices(symbol)).await?;
        stream.close().await;
        command.close().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
