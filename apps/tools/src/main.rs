use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_settings, Settings},
    wizard::{WizardAction, WizardController},
    InMemoryPostShadow, PostgateClient, QuoteDetachAction, QuotepostAction, RepoAgent,
    XrpcAgent,
};
use shared::domain::{AtUri, Did, FeedSummary, Handle, ProfileSummary};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// PDS base url; overrides client.toml and APP__SERVICE_URL.
    #[arg(long)]
    service_url: Option<String>,
    #[arg(long)]
    identifier: Option<String>,
    /// Falls back to ATP_PASSWORD.
    #[arg(long)]
    password: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(subcommand)]
    Postgate(PostgateCommand),
    #[command(subcommand)]
    StarterPack(StarterPackCommand),
}

#[derive(Subcommand, Debug)]
enum PostgateCommand {
    Get {
        post_uri: AtUri,
    },
    Detach {
        #[arg(long)]
        quoted: AtUri,
        #[arg(long)]
        quoting: AtUri,
    },
    Reattach {
        #[arg(long)]
        quoted: AtUri,
        #[arg(long)]
        quoting: AtUri,
    },
    DisableQuotes {
        post_uri: AtUri,
    },
    EnableQuotes {
        post_uri: AtUri,
    },
}

#[derive(Subcommand, Debug)]
enum StarterPackCommand {
    /// Walks the wizard offline and prints the resulting draft.
    Draft {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: String,
        /// `<did>,<handle>`
        #[arg(long = "profile")]
        profiles: Vec<String>,
        #[arg(long = "feed")]
        feeds: Vec<AtUri>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    match cli.command {
        Command::StarterPack(StarterPackCommand::Draft {
            name,
            description,
            profiles,
            feeds,
        }) => draft_starter_pack(name, description, &profiles, feeds),
        Command::Postgate(command) => {
            let settings = load_settings()?;
            let agent = connect(&settings, cli.service_url, cli.identifier, cli.password).await?;
            run_postgate(agent, &settings, command).await
        }
    }
}

async fn connect(
    settings: &Settings,
    service_url: Option<String>,
    identifier: Option<String>,
    password: Option<String>,
) -> Result<Arc<XrpcAgent>> {
    let service_url = service_url.unwrap_or_else(|| settings.service_url.clone());
    let agent = XrpcAgent::new(&service_url)?;

    if let Some(identifier) = identifier {
        let password = password
            .or_else(|| std::env::var("ATP_PASSWORD").ok())
            .ok_or_else(|| anyhow!("--password or ATP_PASSWORD is required with --identifier"))?;
        agent
            .login(&identifier, &password)
            .await
            .with_context(|| format!("failed to sign in as {identifier}"))?;
    }

    info!(service_url = %service_url, "tools: connected");
    Ok(Arc::new(agent))
}

async fn run_postgate(
    agent: Arc<XrpcAgent>,
    settings: &Settings,
    command: PostgateCommand,
) -> Result<()> {
    let client = PostgateClient::with_retry_policy(
        agent.clone(),
        Arc::new(InMemoryPostShadow::new()),
        settings.retry_policy(),
    );

    match command {
        PostgateCommand::Get { post_uri } => {
            let record = client.get_record_or_default(&post_uri).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        PostgateCommand::Detach { quoted, quoting } => {
            let post = fetch_post(agent.as_ref(), &quoting).await?;
            client
                .toggle_quote_detachment(&post, &quoted, QuoteDetachAction::Detach)
                .await?;
            println!("detached {quoting} from {quoted}");
        }
        PostgateCommand::Reattach { quoted, quoting } => {
            let post = fetch_post(agent.as_ref(), &quoting).await?;
            client
                .toggle_quote_detachment(&post, &quoted, QuoteDetachAction::Reattach)
                .await?;
            println!("reattached {quoting} to {quoted}");
        }
        PostgateCommand::DisableQuotes { post_uri } => {
            client
                .toggle_quotepost_enabled(&post_uri, QuotepostAction::Disable)
                .await?;
            println!("quotes disabled for {post_uri}");
        }
        PostgateCommand::EnableQuotes { post_uri } => {
            client
                .toggle_quotepost_enabled(&post_uri, QuotepostAction::Enable)
                .await?;
            println!("quotes enabled for {post_uri}");
        }
    }

    Ok(())
}

async fn fetch_post(agent: &XrpcAgent, uri: &AtUri) -> Result<shared::protocol::PostView> {
    agent
        .get_posts(std::slice::from_ref(uri))
        .await
        .with_context(|| format!("failed to fetch post {uri}"))?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("post {uri} not found"))
}

fn draft_starter_pack(
    name: String,
    description: String,
    profiles: &[String],
    feeds: Vec<AtUri>,
) -> Result<()> {
    let mut wizard = WizardController::new(None, None);
    wizard.dispatch(WizardAction::SetName(name));
    wizard.dispatch(WizardAction::SetDescription(description));
    if !wizard.state().can_next {
        bail!("a description is required before choosing profiles");
    }
    wizard.dispatch(WizardAction::Next);

    for raw in profiles {
        let (did, handle) = raw
            .split_once(',')
            .ok_or_else(|| anyhow!("profile '{raw}' must be <did>,<handle>"))?;
        let did = Did::new(did.trim());
        if wizard.has_profile(&did) {
            continue;
        }
        wizard.dispatch(WizardAction::AddProfile(ProfileSummary {
            did,
            handle: Handle::new(handle.trim()),
            display_name: None,
            avatar: None,
        }));
    }
    wizard.dispatch(WizardAction::Next);

    for uri in feeds {
        if wizard.has_feed(&uri) {
            continue;
        }
        let creator = uri
            .authority_did()
            .ok_or_else(|| anyhow!("feed uri {uri} must use a did authority"))?;
        wizard.dispatch(WizardAction::AddFeed(FeedSummary {
            display_name: uri.rkey().unwrap_or_default().to_string(),
            uri,
            creator,
            description: None,
        }));
    }

    let draft = wizard.into_state();
    println!("{}", serde_json::to_string_pretty(&draft)?);
    Ok(())
}
