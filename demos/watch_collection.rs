use std::env;
use std::error::Error;
use std::sync::Arc;

use secrecy::SecretString;
use syncano_sync::auth::ApiKeyAuthenticator;
use syncano_sync::config::SyncOptions;
use syncano_sync::stream::client::WebSocketTransport;
use syncano_sync::stream::registry::SubscriptionRequest;
use syncano_sync::stream::session::SyncSession;
use tracing_subscriber::EnvFilter;

fn required(name: &str) -> Result<String, Box<dyn Error>> {
    env::var(name).map_err(|_| format!("{name} must be set").into())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let instance = required("SYNCANO_INSTANCE")?;
    let api_key = required("SYNCANO_API_KEY")?;
    let project_id = required("SYNCANO_PROJECT_ID")?;
    let collection_id = required("SYNCANO_COLLECTION_ID")?;
    let local = env::var("SYNCANO_LOCAL").is_ok_and(|value| value == "1");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let authenticator = Arc::new(ApiKeyAuthenticator::new(
            instance,
            SecretString::new(api_key),
        ));
        let transport = Arc::new(WebSocketTransport::new().with_local_mode(local));
        let session = SyncSession::new(authenticator, transport, SyncOptions::default());

        session.events().on_new(|notification| {
            println!(
                "new {} id={}",
                notification.object.as_str(),
                notification.entity.id()
            );
            Ok(())
        });
        session.events().on_change(|notification| {
            println!(
                "change {} ids={:?} fields={:?}",
                notification.object.as_str(),
                notification.target.ids,
                notification.changed_fields
            );
            Ok(())
        });
        session.events().on_delete(|notification| {
            println!(
                "delete {} ids={:?}",
                notification.object.as_str(),
                notification.target.ids
            );
            Ok(())
        });
        session.events().on_error(|error| {
            eprintln!("sync error: {error}");
            Ok(())
        });

        session.subscribe_collection(
            SubscriptionRequest::new(project_id).collection_id(collection_id),
        )?;
        session.start().await?;
        println!("connected session_id={:?}", session.session_id());

        tokio::signal::ctrl_c().await?;
        session.stop().await;
        Ok::<(), Box<dyn Error>>(())
    })
}
