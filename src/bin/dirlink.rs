use std::{error::Error, time::Duration};

use clap::{Parser, Subcommand};
use crossbeam_channel::bounded;
use dirlink::{
    Connection, ConnectionConfig,
    protocol::{
        BindRequest, ChangeTypes, Control, EntryChange, LdapResult, Outcome, Request, Response,
        Scope, SearchEntry, SearchRequest,
    },
};
use log::{info, warn};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address, e.g. localhost:389
    address: String,
    /// Seconds to wait for each response
    #[arg(long, default_value_t = 30)]
    timeout: u64,
    /// Bind as this DN before running the command
    #[arg(long, requires = "password")]
    bind_dn: Option<String>,
    #[arg(long, requires = "bind_dn")]
    password: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream the entries matching a filter
    Search {
        base: String,
        #[arg(default_value = "(objectClass=*)")]
        filter: String,
        /// base, one or sub
        #[arg(long, default_value = "sub")]
        scope: Scope,
        /// Entries per batch; 0 waits for the whole result
        #[arg(long, default_value_t = 100)]
        batch: usize,
        /// Attributes to return; all when empty
        attributes: Vec<String>,
    },
    /// Print changes under a base until interrupted
    Watch {
        base: String,
        #[arg(default_value = "(objectClass=*)")]
        filter: String,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config =
        ConnectionConfig::default().with_operation_timeout(Duration::from_secs(cli.timeout));
    let connection = Connection::connect(cli.address.as_str(), &config)?;

    if let (Some(dn), Some(password)) = (&cli.bind_dn, &cli.password) {
        bind(&connection, dn, password, config.operation_timeout)?;
    }

    match cli.command {
        Command::Search {
            base,
            filter,
            scope,
            batch,
            attributes,
        } => {
            let request = SearchRequest::new(base, scope, filter).with_attributes(attributes);
            search(&connection, request, &config.with_batch_size(batch))?;
        }
        Command::Watch { base, filter } => {
            let request = SearchRequest::new(base, Scope::Subtree, filter);
            watch(&connection, request)?;
        }
    }

    connection.close()?;
    Ok(())
}

fn bind(
    connection: &Connection,
    dn: &str,
    password: &str,
    timeout: Duration,
) -> Result<(), Box<dyn Error>> {
    let request = Request::Bind(BindRequest::simple(dn, password));
    let response = connection.call(request, vec![], timeout)?;
    match response.payload().result().map(LdapResult::outcome) {
        Some(Outcome::Success) => {
            info!("bound as {dn}");
            Ok(())
        }
        Some(Outcome::Referral(urls)) => Err(format!("bind referred to {urls:?}").into()),
        Some(Outcome::Failure(code)) => Err(format!("bind failed with {code:?}").into()),
        None => Err("unexpected bind response".into()),
    }
}

fn search(
    connection: &Connection,
    request: SearchRequest,
    config: &ConnectionConfig,
) -> Result<(), Box<dyn Error>> {
    let timeout = config.operation_timeout;
    let mut results = connection.search_results(request, vec![], timeout, config.batch_size)?;

    for entry in results.entries(timeout) {
        print_entry(&entry?);
    }
    for urls in results.references() {
        println!("# reference: {}", urls.join(" "));
    }
    match results.result() {
        Some(result) => print_result(result),
        None => warn!("search ended without a result"),
    }
    Ok(())
}

fn watch(connection: &Connection, request: SearchRequest) -> Result<(), Box<dyn Error>> {
    let (stop, stopped) = bounded(1);
    let interrupt = stop.clone();
    ctrlc::set_handler(move || {
        let _ = interrupt.try_send(());
    })?;

    let control = Control::persistent_search(ChangeTypes::ALL, true, true)?;
    let subscription =
        connection.register_async(Request::Search(request), vec![control], move |message| {
            match message {
                Ok(message) => match message.payload() {
                    Response::SearchEntry(entry) => {
                        match EntryChange::find(message.controls()) {
                            Ok(Some(change)) => {
                                println!("# {}", change_name(change.change_types()))
                            }
                            Ok(None) => {}
                            Err(err) => warn!("bad entry change control: {err}"),
                        }
                        print_entry(entry);
                    }
                    Response::SearchDone(result) => {
                        print_result(result);
                        let _ = stop.try_send(());
                    }
                    _ => {}
                },
                Err(err) => {
                    eprintln!("watch failed: {err}");
                    let _ = stop.try_send(());
                }
            }
        })?;

    info!("watching, press Ctrl-C to stop");
    stopped.recv()?;

    if let Some(id) = subscription.id() {
        if connection.is_open() {
            connection.abandon(id)?;
        }
    }
    subscription.cancel();
    Ok(())
}

fn change_name(types: ChangeTypes) -> &'static str {
    match types {
        ChangeTypes::ADD => "add",
        ChangeTypes::DELETE => "delete",
        ChangeTypes::MODIFY => "modify",
        ChangeTypes::MODIFY_DN => "modrdn",
        _ => "change",
    }
}

fn print_entry(entry: &SearchEntry) {
    println!("dn: {}", entry.dn);
    for attribute in &entry.attributes {
        for value in &attribute.values {
            println!("{}: {value}", attribute.name);
        }
    }
    println!();
}

fn print_result(result: &LdapResult) {
    if result.diagnostic.is_empty() {
        println!("# result: {:?}", result.code);
    } else {
        println!("# result: {:?} ({})", result.code, result.diagnostic);
    }
}
