use {
    clap::{Parser, Subcommand},
    log::info,
    std::io::{self, Read, Write},
    styx::{Client, Endpoint},
};

#[derive(Debug, Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    #[arg(short, long, default_value = "tcp!127.0.0.1!5640")]
    address: String,

    /// User name to authenticate as
    #[arg(short, long, default_value = "nobody")]
    user: String,

    /// Resource root to attach to
    #[arg(short, long, default_value = "")]
    root: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the entries of a directory
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Print the contents of a resource to stdout
    Read { path: String },
    /// Write stdin to a resource
    Write { path: String },
    /// Print the metadata of a resource
    Stat { path: String },
}

async fn run(cli: Cli) -> styx::Result<()> {
    let endpoint: Endpoint = cli.address.parse()?;

    let client = Client::connect(&endpoint).await?;
    if client.auth(&cli.user, &cli.root).await?.is_some() {
        info!("authenticated as {}", cli.user);
    }
    client.attach(&cli.user, &cli.root).await?;

    match cli.command {
        Command::Ls { path } => {
            for stat in client.list(&path).await? {
                println!("{}", stat.name);
            }
        }
        Command::Read { path } => {
            let bytes = client.read_path(&path).await?;
            io::stdout().write_all(&bytes)?;
        }
        Command::Write { path } => {
            let mut content = Vec::new();
            io::stdin().read_to_end(&mut content)?;
            client.write_path(&path, &content).await?;
        }
        Command::Stat { path } => {
            let fid = client.walk(&path).await?;
            let res = client.stat(fid).await;
            let _ = client.clunk(fid).await;

            let stat = res?;
            println!(
                "{} mode {:o} length {} qid ({:#04x} {} {})",
                stat.name,
                stat.mode,
                stat.length,
                stat.qid.typ.bits(),
                stat.qid.version,
                stat.qid.path,
            );
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
