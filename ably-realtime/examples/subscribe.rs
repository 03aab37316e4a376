//! Follow a channel's messages and presence, signing token requests locally.
//!
//! ```sh
//! ABLY_API_KEY=keyName:keySecret cargo run -p ably-realtime --example subscribe -- <CHANNEL>
//! ```
//!
//! Optional environment:
//! - `ABLY_CLIENT_ID`: identity embedded in every signed token request
//! - `ABLY_REALTIME_HOST`: realtime endpoint override (e.g. a sandbox cluster)
//!
//! Message payloads go to stdout, everything else to stderr.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use ably_realtime::{
    BoxError, ClientOptions, ConnectionState, Data, EventFilter, Realtime, TokenRequest,
};

const TOKEN_TTL_MS: i64 = 60 * 60 * 1000;
const CAPABILITY: &str = r#"{"*":["subscribe","presence"]}"#;

/// Key material used to sign each token request the client asks for.
#[derive(Clone)]
struct Signer {
    key_name: String,
    key_secret: String,
    client_id: Option<String>,
}

impl Signer {
    fn from_env() -> Result<Self, BoxError> {
        let key = std::env::var("ABLY_API_KEY").map_err(|_| "ABLY_API_KEY is not set")?;
        let (name, secret) = key
            .split_once(':')
            .ok_or("ABLY_API_KEY must look like keyName:keySecret")?;
        Ok(Self {
            key_name: name.to_string(),
            key_secret: secret.to_string(),
            client_id: std::env::var("ABLY_CLIENT_ID").ok(),
        })
    }

    fn sign(&self) -> Result<TokenRequest, BoxError> {
        let since_epoch = SystemTime::now().duration_since(UNIX_EPOCH)?;
        let timestamp = i64::try_from(since_epoch.as_millis())?;
        let nonce = format!("{:016x}", nonce_bits(since_epoch.subsec_nanos()));
        let client_id = self.client_id.clone().unwrap_or_default();

        // Fields are newline-terminated in this fixed order.
        let text = [
            self.key_name.as_str(),
            &TOKEN_TTL_MS.to_string(),
            CAPABILITY,
            &client_id,
            &timestamp.to_string(),
            &nonce,
        ]
        .iter()
        .fold(String::new(), |mut acc, field| {
            acc.push_str(field);
            acc.push('\n');
            acc
        });

        let mut mac = Hmac::<Sha256>::new_from_slice(self.key_secret.as_bytes())
            .map_err(|e| format!("HMAC error: {e}"))?;
        mac.update(text.as_bytes());

        Ok(TokenRequest {
            key_name: self.key_name.clone(),
            timestamp,
            nonce,
            mac: STANDARD.encode(mac.finalize().into_bytes()),
            capability: CAPABILITY.to_string(),
            ttl: Some(TOKEN_TTL_MS),
            client_id: self.client_id.clone(),
        })
    }
}

fn nonce_bits(seed: u32) -> u64 {
    (u64::from(std::process::id()) << 32) ^ u64::from(seed)
}

fn render(data: &Data) -> String {
    match data {
        Data::None => "null".to_string(),
        Data::String(s) => s.clone(),
        Data::Binary(b) => format!("base64:{}", STANDARD.encode(b)),
        Data::Json(v) => v.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt::init();

    let channel_name = std::env::args()
        .nth(1)
        .ok_or("usage: subscribe <CHANNEL>")?;
    let signer = Signer::from_env()?;

    let mut options = ClientOptions::with_auth_callback(move || {
        let signer = signer.clone();
        async move { signer.sign() }
    });
    options.realtime_host = std::env::var("ABLY_REALTIME_HOST").ok();

    let client = Realtime::new(options)?;
    client.connection().on(EventFilter::Any, |change| match &change.reason {
        Some(reason) => eprintln!("connection {} -> {} ({reason})", change.previous, change.current),
        None => eprintln!("connection {} -> {}", change.previous, change.current),
    });

    let channel = client.channels().get(&channel_name);
    channel.on(EventFilter::Any, |change| {
        eprintln!("channel {} -> {}", change.previous, change.current);
    });
    channel
        .subscribe(EventFilter::Any, |msg| {
            let name = msg.name.as_deref().unwrap_or("(unnamed)");
            eprintln!("message {name} from {:?}", msg.client_id);
            println!("{}", render(&msg.data));
        })
        .await?;
    channel
        .presence()
        .subscribe(EventFilter::Any, |member| {
            eprintln!("presence {} {}", member.action, member.client_id);
        })
        .await?;

    eprintln!("listening on '{channel_name}', ctrl-c to stop");
    let connection = client.connection();
    tokio::select! {
        failed = connection.when_state(ConnectionState::Failed) => {
            if let Some(reason) = failed.and_then(|change| change.reason) {
                return Err(reason.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            client.close();
        }
    }
    Ok(())
}
