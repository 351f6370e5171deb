use clap::Parser;

fn main() {
    let cli = clipflowctl::Cli::parse();
    if let Err(err) = clipflowctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
