use {
    clap::Parser,
    std::sync::Arc,
    styx::{Endpoint, Namespace, io_err, srv},
    tokio::sync::RwLock,
};

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    #[arg(default_value = "tcp!127.0.0.1!5640")]
    address: String,

    /// Mount a text resource under the root, given as segment=content
    #[arg(long = "mount", value_name = "SEG=TEXT")]
    mounts: Vec<String>,

    /// Export the built-in demonstration tree
    #[arg(long)]
    demo: bool,
}

fn build_namespace(cli: &Cli) -> styx::Result<Namespace> {
    let mut ns = Namespace::new();
    let root = ns.root();

    if cli.demo {
        let somewhere = ns.add_data(b"Here there be dragons".to_vec());
        ns.mount(root, "pathSomewhere", somewhere)?;

        let dir = ns.add_dir();
        ns.mount(root, "non_empty_dir", dir)?;
        let internal = ns.add_dir();
        ns.mount(dir, "internal", internal)?;

        let data = ns.add_dir();
        ns.mount(root, "data", data)?;
        let updated = ns.add_data(b"hello".to_vec());
        ns.mount(data, "updated", updated)?;
    }

    for spec in &cli.mounts {
        let (segment, content) = spec
            .split_once('=')
            .ok_or_else(|| io_err!(InvalidInput, "expected SEG=TEXT"))?;

        let node = ns.add_data(content.as_bytes().to_vec());
        ns.mount(root, segment, node)?;
    }

    Ok(ns)
}

async fn styxd_main(cli: Cli) -> styx::Result<i32> {
    let endpoint: Endpoint = cli.address.parse()?;
    let namespace = build_namespace(&cli)?;

    println!("[*] Ready to accept clients: {}", endpoint);
    srv::serve(Arc::new(RwLock::new(namespace)), &endpoint)
        .await
        .and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = styxd_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        -1
    });

    std::process::exit(exit_code);
}
