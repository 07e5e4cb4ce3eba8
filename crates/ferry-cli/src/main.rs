use ferry_cli::{cli, run};

#[tokio::main]
async fn main() {
    let action = match cli::parse_from(std::env::args_os()) {
        Ok(action) => action,
        Err(e) => e.exit(),
    };

    let code = match run::execute(action).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            run::exit_code(&e)
        }
    };

    std::process::exit(code);
}
