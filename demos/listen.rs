use std::error::Error;
use std::sync::Arc;

use eventline::auth::{LoginFlag, TokenClient};
use eventline::stream::client::{SseClient, SseClientOptions};
use eventline::stream::event::{EventData, EventTypes};

fn main() -> Result<(), Box<dyn Error>> {
    let server_base_url = "https://REPLACE_WITH_SERVER_HOST".to_string();
    let stream_url = "https://REPLACE_WITH_STREAM_HOST/api/sse".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let login = LoginFlag::new(true);
        let tokens = TokenClient::new(server_base_url)?;
        let client = SseClient::with_options(
            stream_url,
            tokens,
            Arc::new(login),
            SseClientOptions {
                event_types: EventTypes::new(["demo"]),
                ..SseClientOptions::default()
            },
        );

        let mut events = client.subscribe();
        let mut status = client.status();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                println!("status={:?}", *status.borrow());
            }
        });

        while let Some(event) = events.recv().await {
            match event.data {
                EventData::Json(value) => println!("{}: {value}", event.event_type),
                EventData::Text(text) => println!("{}: {text}", event.event_type),
            }
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
