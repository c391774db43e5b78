use std::path::PathBuf;

#[tokio::main]
async fn main() {
    let workspace_root = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => match std::env::current_dir() {
            Ok(path) => path,
            Err(error) => {
                eprintln!("huddle: failed to resolve current directory: {error}");
                std::process::exit(1);
            }
        },
    };

    if let Err(error) = huddle::run(workspace_root).await {
        tracing::error!(%error, "huddle exited with an error");
        eprintln!("huddle: {error}");
        std::process::exit(1);
    }
}
