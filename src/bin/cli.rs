use std::fs;

use chrono::Utc;
use clap::{Parser, Subcommand};
use reqwest::{Client, Method};
use serde_json::{json, Value};

use worldvisa_dms::auth::{is_expired, sign_token, TokenValidator};
use worldvisa_dms::backend::BackendClient;
use worldvisa_dms::cache::{fetcher, CacheConfig, QueryCache};
use worldvisa_dms::events::Channel;
use worldvisa_dms::invalidation::{keys, keys_for_event};
use worldvisa_dms::models::{Application, Envelope, Notification, Role, TokenClaims};
use worldvisa_dms::subscriber::StreamSubscriber;

const TOKEN_FILE: &str = ".dms_token";

#[derive(Parser)]
#[command(name = "dms-cli")]
#[command(about = "CLI for the WorldVisa DMS gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = "http://localhost:3000")]
    url: String,
}

#[derive(Subcommand)]
enum Commands {
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    Logout,
    Applications {
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(short, long)]
        search: Option<String>,
        /// main or spouse
        #[arg(short = 't', long = "type")]
        kind: Option<String>,
    },
    Documents {
        #[arg(short, long)]
        application: String,
        #[arg(short, long)]
        category: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
    DeleteDoc {
        #[arg(short, long)]
        id: String,
        #[arg(short, long)]
        application: Option<String>,
    },
    Notifications,
    DeadlineStats {
        #[arg(short = 't', long = "type", default_value = "main")]
        kind: String,
    },
    /// Decode the saved (or given) token without contacting anyone
    DecodeToken {
        token: Option<String>,
    },
    /// Sign a token for local testing against a gateway with DMS_JWT_SECRET set
    DevToken {
        #[arg(short, long)]
        id: String,
        #[arg(short, long, default_value = "admin")]
        role: String,
        #[arg(short, long)]
        secret: String,
        #[arg(long, default_value_t = 3600)]
        ttl: i64,
    },
    /// Follow an event stream and keep a live notification list
    Watch {
        /// notifications, client-notifications or comments
        #[arg(short, long, default_value = "notifications")]
        channel: String,
    },
}

fn saved_token() -> String {
    fs::read_to_string(TOKEN_FILE).unwrap_or_default().trim().to_string()
}

fn print_json(value: &Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let gateway = BackendClient::new(cli.url.clone());

    match cli.command {
        Commands::Login { email, password } => {
            let body = gateway
                .send_json(
                    Method::POST,
                    "/api/auth/login",
                    &json!({ "email": email, "password": password }),
                    None,
                )
                .await;
            match body {
                Ok(body) => {
                    let token = body
                        .pointer("/data/token")
                        .or_else(|| body.get("token"))
                        .and_then(Value::as_str)
                        .ok_or("login response did not include a token")?;
                    fs::write(TOKEN_FILE, token)?;
                    println!("Logged in. Token saved to {TOKEN_FILE}");
                }
                Err(err) => println!("Login failed: {err}"),
            }
        }
        Commands::Logout => {
            let _ = fs::remove_file(TOKEN_FILE);
            println!("Logged out (token removed).");
        }
        Commands::Applications { page, limit, search, kind } => {
            let mut query = vec![
                ("page".to_string(), page.to_string()),
                ("limit".to_string(), limit.to_string()),
            ];
            if let Some(search) = search {
                query.push(("search".to_string(), search));
            }
            if let Some(kind) = kind {
                query.push(("type".to_string(), kind));
            }
            let body = gateway.get_json("/api/applications", &query, &saved_token()).await?;
            let apps: Option<Vec<Application>> = body
                .get("data")
                .and_then(|data| serde_json::from_value(data.clone()).ok());
            match apps {
                Some(apps) => {
                    for app in apps {
                        println!(
                            "{:<24} {:<32} {:<8} {}",
                            app.id,
                            app.name,
                            app.kind.as_str(),
                            app.status.as_deref().unwrap_or("-")
                        );
                    }
                }
                None => print_json(&body),
            }
        }
        Commands::Documents { application, category, status, page } => {
            let mut query = vec![("page".to_string(), page.to_string())];
            if let Some(category) = category {
                query.push(("category".to_string(), category));
            }
            if let Some(status) = status {
                query.push(("status".to_string(), status));
            }
            let path = format!("/api/applications/{application}/documents");
            print_json(&gateway.get_json(&path, &query, &saved_token()).await?);
        }
        Commands::DeleteDoc { id, application } => {
            let path = match application {
                Some(app) => format!("/api/documents/{id}?application_id={app}"),
                None => format!("/api/documents/{id}"),
            };
            print_json(&gateway.delete(&path, &saved_token()).await?);
        }
        Commands::Notifications => {
            let body = gateway.get_json("/api/notifications", &[], &saved_token()).await?;
            print_notifications(&body);
        }
        Commands::DeadlineStats { kind } => {
            let query = [("type".to_string(), kind)];
            print_json(&gateway.get_json("/api/dashboard/deadline-stats", &query, &saved_token()).await?);
        }
        Commands::DecodeToken { token } => {
            let token = token.unwrap_or_else(saved_token);
            match TokenValidator::unverified().decode_token(&token) {
                Some(claims) => {
                    print_json(&serde_json::to_value(&claims)?);
                    println!("expired: {}", is_expired(&claims));
                }
                None => println!("Malformed token"),
            }
        }
        Commands::DevToken { id, role, secret, ttl } => {
            let role: Role = serde_json::from_value(json!(role))?;
            let now = Utc::now().timestamp();
            let claims = TokenClaims {
                id,
                email: None,
                role,
                exp: now + ttl,
                iat: Some(now),
            };
            println!("{}", sign_token(&claims, secret.as_bytes())?);
        }
        Commands::Watch { channel } => {
            let channel = Channel::parse(&channel).ok_or("unknown channel")?;
            watch(&cli.url, gateway, channel).await?;
        }
    }

    Ok(())
}

fn print_notifications(body: &Value) {
    let list: Option<Vec<Notification>> = body
        .get("data")
        .and_then(|data| serde_json::from_value(data.clone()).ok());
    match list {
        Some(list) => {
            let unread = list.iter().filter(|n| !n.is_read).count();
            println!("{} notifications, {unread} unread", list.len());
            for n in list {
                println!("{} {}", if n.is_read { " " } else { "*" }, n.message);
            }
        }
        None => print_json(body),
    }
}

/// Streams events and mirrors them into a local cache: each event
/// invalidates its keys, and the mounted notification list refetches.
async fn watch(url: &str, gateway: BackendClient, channel: Channel) -> Result<(), Box<dyn std::error::Error>> {
    let token = saved_token();
    let claims = TokenValidator::unverified()
        .decode_token(&token)
        .ok_or("no valid token saved, run login first")?;

    let mut subscriber = StreamSubscriber::connect(
        &Client::new(),
        &format!("{}{}", url.trim_end_matches('/'), channel.path()),
        &token,
    )
    .await?;

    let cache = QueryCache::new(CacheConfig::default());
    let list_token = token.clone();
    let mut notifications = cache
        .subscribe(
            keys::notifications_for(&claims.id),
            fetcher(move || {
                let gateway = gateway.clone();
                let token = list_token.clone();
                async move { gateway.get_json("/api/notifications", &[], &token).await }
            }),
        )
        .await;

    loop {
        tokio::select! {
            event = subscriber.recv() => match event {
                Some(event) => {
                    println!("event: {}", serde_json::to_string(&event)?);
                    cache.invalidate_all(&keys_for_event(&event)).await;
                }
                None => {
                    print_json(&serde_json::to_value(Envelope::error("stream closed"))?);
                    break;
                }
            },
            list = notifications.changed() => match list {
                Some(list) => print_notifications(&list),
                None => break,
            },
        }
    }
    Ok(())
}
