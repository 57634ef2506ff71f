//! Fleety support client from a terminal

use std::io::Write;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use fleety_client::{ClientConfig, ReplyFragment, SupportWidget};
use fleety_shared::{SavedTicket, Ticket, TicketSlug, WidgetError};

#[derive(Parser)]
#[command(name = "fleety", about = "Fleety support chat and tickets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the support assistant
    Chat {
        #[arg(required = true, trailing_var_arg = true)]
        message: Vec<String>,
    },

    /// Open a new support ticket
    Create { title: String, description: String },

    /// Show a ticket thread and mark it read
    Open { slug: String },

    /// Reply on a ticket
    Send {
        slug: String,
        #[arg(required = true, trailing_var_arg = true)]
        message: Vec<String>,
    },

    /// List saved tickets with fresh unread counts
    List,

    /// Follow live updates, for one ticket or for the saved list
    Watch { slug: Option<String> },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FLEETY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = ClientConfig::from_env().context("Failed to load configuration")?;
    let widget = SupportWidget::new(config).map_err(|e| anyhow::anyhow!(e.notice()))?;

    let result = match cli.command {
        Commands::Chat { message } => chat(&widget, message.join(" ")).await,
        Commands::Create { title, description } => create(&widget, &title, &description).await,
        Commands::Open { slug } => open(&widget, &TicketSlug::from(slug)).await,
        Commands::Send { slug, message } => {
            send(&widget, &TicketSlug::from(slug), &message.join(" ")).await
        }
        Commands::List => list(&widget).await,
        Commands::Watch { slug } => watch(&widget, slug.map(TicketSlug::from)).await,
    };

    widget.shutdown();
    result.map_err(|e| anyhow::anyhow!(e.notice()))
}

async fn chat(widget: &SupportWidget, message: String) -> Result<(), WidgetError> {
    let mut reply = widget.chat().send(message);
    let mut printed = 0;
    let mut stdout = std::io::stdout();

    loop {
        let fragment = tokio::select! {
            fragment = reply.next() => fragment,
            _ = tokio::signal::ctrl_c() => {
                reply.cancel();
                println!();
                return Ok(());
            }
        };

        match fragment {
            Some(ReplyFragment::Partial { text }) => {
                // Each fragment extends the previous one
                let _ = write!(stdout, "{}", &text[printed.min(text.len())..]);
                let _ = stdout.flush();
                printed = text.len();
            }
            Some(ReplyFragment::Complete { text, ticket_slug }) => {
                println!("{}", text);
                if let Some(slug) = ticket_slug {
                    println!("Ticket created: {}", slug);
                }
            }
            Some(ReplyFragment::Failed(e)) => return Err(e),
            None => break,
        }
    }

    if printed > 0 {
        println!();
    }
    Ok(())
}

async fn create(widget: &SupportWidget, title: &str, description: &str) -> Result<(), WidgetError> {
    let ticket = widget.view().create(title, description).await?;
    println!("Ticket created: {}", ticket.slug);
    print_ticket(&ticket);
    Ok(())
}

async fn open(widget: &SupportWidget, slug: &TicketSlug) -> Result<(), WidgetError> {
    let ticket = widget.view().open(slug).await?;
    print_ticket(&ticket);
    Ok(())
}

async fn send(widget: &SupportWidget, slug: &TicketSlug, message: &str) -> Result<(), WidgetError> {
    widget.view().open(slug).await?;
    widget.view().send_message(message).await?;
    if let Some(ticket) = widget.view().current() {
        print_ticket(&ticket);
    }
    Ok(())
}

async fn list(widget: &SupportWidget) -> Result<(), WidgetError> {
    widget.on_open().await;
    let tickets = widget.tickets().summaries();
    if tickets.is_empty() {
        println!("No saved tickets");
        return Ok(());
    }

    for ticket in &tickets {
        print_summary(ticket);
    }
    println!("Unread: {}", widget.tickets().total_unread());
    Ok(())
}

async fn watch(widget: &SupportWidget, slug: Option<TicketSlug>) -> Result<(), WidgetError> {
    match slug {
        Some(slug) => {
            let mut current = widget.view().watch();
            widget.view().open(&slug).await?;
            loop {
                if let Some(ticket) = current.borrow_and_update().clone() {
                    print_ticket(&ticket);
                }
                tokio::select! {
                    changed = current.changed() => if changed.is_err() { break },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        None => {
            let mut summaries = widget.tickets().watch();
            widget.on_open().await;
            loop {
                let tickets = summaries.borrow_and_update().clone();
                println!("--");
                for ticket in &tickets {
                    print_summary(ticket);
                }
                tokio::select! {
                    changed = summaries.changed() => if changed.is_err() { break },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
    }
    Ok(())
}

fn print_summary(ticket: &SavedTicket) {
    let unread = if ticket.unread_count > 0 {
        format!(" ({} unread)", ticket.unread_count)
    } else {
        String::new()
    };
    println!(
        "{:<16} [{}] {}{}",
        ticket.slug,
        ticket.status.label(),
        ticket.title,
        unread
    );
}

fn print_ticket(ticket: &Ticket) {
    println!("{} [{}]", ticket.title, ticket.status.label());
    for message in &ticket.messages {
        let pending = if message.is_provisional() { " (sending)" } else { "" };
        println!(
            "  {}{}: {}",
            message.author.display_name(),
            pending,
            message.content
        );
    }
}
