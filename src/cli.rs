//! CLI argument definitions using clap derive macros.

use clap::{Args as ClapArgs, Parser, Subcommand};

use bakery_client::config::DEFAULT_LOGIN_METHOD;

/// Send HTTP requests with macaroon authorization.
///
/// Answers 401 macaroon challenges by discharging third-party caveats,
/// logging in through the browser or with an agent credential, and replays
/// the request once.
#[derive(Parser, Debug)]
#[command(name = "bakery")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Backend service name; credentials are stored as Macaroons-<service>
    #[arg(short, long, default_value = "default", global = true)]
    pub service: String,

    /// Base URL that relative request paths are resolved against
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Endpoint that receives each new macaroon set via PUT
    #[arg(long, global = true)]
    pub set_cookie_path: Option<String>,

    /// Log in with the credential in BAKERY_AUTH instead of opening a browser
    #[arg(long, global = true)]
    pub non_interactive: bool,

    /// Field of the identity provider's login methods used for agent login
    #[arg(long, default_value = DEFAULT_LOGIN_METHOD, global = true)]
    pub login_method: String,

    /// Keep credentials in the encrypted credential file across runs
    #[arg(long, global = true)]
    pub persist: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Request verbs and credential management.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a GET request
    Get(ReadArgs),
    /// Send a DELETE request
    Delete(ReadArgs),
    /// Send a POST request with a JSON body
    Post(WriteArgs),
    /// Send a PUT request with a JSON body
    Put(WriteArgs),
    /// Send a PATCH request with a JSON body
    Patch(WriteArgs),
    /// Remove stored macaroons and the discharge token
    Logout,
}

/// Arguments for verbs without a body.
#[derive(ClapArgs, Debug)]
pub struct ReadArgs {
    /// Request URL or path
    pub url: String,

    /// Do not discharge 401 macaroon challenges
    #[arg(long)]
    pub no_redirect: bool,
}

/// Arguments for verbs with a JSON body.
#[derive(ClapArgs, Debug)]
pub struct WriteArgs {
    /// Request URL or path
    pub url: String,

    /// JSON request body
    #[arg(short, long, default_value = "{}")]
    pub data: String,

    /// Do not discharge 401 macaroon challenges
    #[arg(long)]
    pub no_redirect: bool,
}
