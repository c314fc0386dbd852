#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for verifying mail accounts through Tor

use clap::{Parser, Subcommand};
use onion_onboard::api::{self, ApiState};
use onion_onboard::onboarding;
use onion_onboard::{
    AttemptId, ChallengeSurface, ConnectionVerifier, OnboardConfig, ProviderProfile,
    ProviderRegistry, Secret, VerificationRequest, VerificationResult,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "onboard-cli")]
#[command(about = "Verify mail accounts through a local Tor proxy")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Verify that an account can log in through Tor
    Verify {
        /// Account email address
        email: String,

        /// Provider id to use when the domain is not recognised
        #[arg(long)]
        provider: Option<String>,

        /// Environment variable holding the password or app token;
        /// read from stdin when unset
        #[arg(long, default_value = "ONBOARD_SECRET")]
        secret_env: String,
    },

    /// Bring the proxy up and check that egress goes through Tor
    CheckProxy,

    /// List known providers
    Providers,

    /// Show which provider serves an address
    Resolve {
        /// Account email address
        email: String,
    },

    /// Serve the HTTP API
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8788")]
        bind: String,
    },
}

/// Prints the challenge URL for the person at the terminal.
struct TerminalSurface;

impl ChallengeSurface for TerminalSurface {
    fn open(&self, attempt_id: AttemptId, url: &str) {
        eprintln!("\nThe provider requires a verification step (attempt {attempt_id}).");
        eprintln!("Open this page in a browser routed through Tor and complete it:\n");
        eprintln!("    {url}\n");
    }

    fn close(&self, _attempt_id: AttemptId) {}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = OnboardConfig::from_env()?;

    match &args.command {
        Command::Verify {
            email,
            provider,
            secret_env,
        } => {
            let verifier = onboarding::verifier_from_config(&config, Arc::new(TerminalSurface))?;
            cmd_verify(&verifier, &args, email, provider.as_deref(), secret_env).await?;
        }
        Command::CheckProxy => {
            let proxy = onboarding::proxy_from_config(&config);
            cmd_check_proxy(proxy.as_ref(), &args).await?;
        }
        Command::Providers => {
            cmd_providers(&ProviderRegistry::load(&config)?, &args)?;
        }
        Command::Resolve { email } => {
            cmd_resolve(&ProviderRegistry::load(&config)?, &args, email)?;
        }
        Command::Serve { bind } => {
            let verifier =
                onboarding::verifier_from_config(&config, Arc::new(onion_onboard::LogSurface))?;
            let listener = tokio::net::TcpListener::bind(bind.as_str()).await?;
            api::serve(listener, ApiState::new(verifier), async {
                tokio::signal::ctrl_c().await.ok();
            })
            .await?;
        }
    }

    Ok(())
}

async fn read_line(prompt: &str) -> anyhow::Result<String> {
    eprint!("{prompt}");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn cmd_verify(
    verifier: &ConnectionVerifier,
    args: &Args,
    email: &str,
    provider: Option<&str>,
    secret_env: &str,
) -> anyhow::Result<()> {
    let secret = match std::env::var(secret_env) {
        Ok(value) => Secret::new(value),
        Err(_) => Secret::new(read_line("Password or app token: ").await?),
    };

    let mut request = VerificationRequest::new(email, secret);
    if let Some(provider) = provider {
        request = request.with_provider_hint(provider);
    }

    let mut result = verifier.verify(request).await;

    if let VerificationResult::NeedsChallenge { attempt_id, .. } = &result {
        let attempt_id = *attempt_id;
        let token = read_line("Press Enter once done (or paste the token you were given): ").await?;
        let token = if token.trim().is_empty() {
            Secret::new("completed")
        } else {
            Secret::new(token.trim())
        };
        verifier.challenges().complete_challenge(attempt_id, token);

        result = verifier
            .outcome(attempt_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("Attempt {attempt_id} ended without a result"))?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }

    if result.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn cmd_check_proxy(
    proxy: &dyn onion_onboard::proxy::ProxyLifecycleManager,
    args: &Args,
) -> anyhow::Result<()> {
    let started = proxy.start().await;
    let live = match &started {
        Ok(_) => proxy.check_live().await,
        Err(_) => false,
    };
    let message = match &started {
        Ok(handle) if live => format!("Connected to Tor network via {}", handle.endpoint),
        Ok(handle) => format!("Proxy at {} is not routing through Tor", handle.endpoint),
        Err(e) => format!("Failed to check Tor connection: {e}"),
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "success": live,
                "message": message,
            }))?
        );
    } else {
        println!("{message}");
    }

    proxy.stop().await;
    if live {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

fn cmd_providers(registry: &ProviderRegistry, args: &Args) -> anyhow::Result<()> {
    let profiles = registry.profiles();

    if args.json {
        println!("{}", serde_json::to_string_pretty(profiles)?);
        return Ok(());
    }

    let header = format!(
        "{:<10} {:<24} {:<28} {:<16} {}",
        "ID", "Name", "Server", "Challenge", "Domains"
    );
    println!("{header}");
    println!("{}", "-".repeat(100));
    for profile in profiles {
        print_profile_row(profile);
    }
    println!("\n{} provider(s)", profiles.len());
    Ok(())
}

fn cmd_resolve(registry: &ProviderRegistry, args: &Args, email: &str) -> anyhow::Result<()> {
    let profile = registry.resolve_provider(email);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else if profile.is_supported() {
        println!("Provider:  {} ({})", profile.display_name, profile.id);
        println!("Server:    {}:{}", profile.host, profile.port);
        println!(
            "Security:  {}",
            if profile.use_tls { "implicit TLS" } else { "STARTTLS" }
        );
        println!("Challenge: {}", profile.challenge_kind);
        if let Some(url) = &profile.challenge_url {
            println!("URL:       {url}");
        }
    } else {
        println!("No supported provider for {email}");
    }
    Ok(())
}

fn print_profile_row(profile: &ProviderProfile) {
    println!(
        "{:<10} {:<24} {:<28} {:<16} {}",
        profile.id,
        truncate(&profile.display_name, 22),
        truncate(&format!("{}:{}", profile.host, profile.port), 26),
        profile.challenge_kind.to_string(),
        profile.domains.join(", "),
    );
}

fn print_result(result: &VerificationResult) {
    match result {
        VerificationResult::Success { .. } => println!("OK: {}", result.message()),
        VerificationResult::NeedsChallenge { url, .. } => {
            println!("Challenge required: {url}");
        }
        VerificationResult::NeedsBridgeSetup { instructions, .. } => {
            println!("Bridge required:\n{instructions}");
        }
        VerificationResult::Failed { kind, message, .. } => {
            println!("FAILED ({kind}): {message}");
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
