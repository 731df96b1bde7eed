//! Client side of the controller socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use capstan_core::{Event, EventStatus};
use capstan_engine::proto::controller_service_client::ControllerServiceClient;
use capstan_engine::proto::ExecuteRequest;
use capstan_engine::ExecuteParams;

/// Connect to the controller over its UNIX socket.
pub async fn connect(socket: &Path) -> Result<ControllerServiceClient<Channel>> {
    let path = socket.to_path_buf();
    // The URI is required by the endpoint API but never resolved; the
    // connector below dials the socket directly.
    let channel = Endpoint::try_from("http://localhost")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                let stream = UnixStream::connect(path).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await
        .with_context(|| format!("connecting to controller at {}", socket.display()))?;
    Ok(ControllerServiceClient::new(channel))
}

/// Wait for the controller socket to appear.
pub async fn wait_for_socket(socket: &PathBuf, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !socket.exists() {
        if tokio::time::Instant::now() >= deadline {
            bail!("controller socket {} did not appear", socket.display());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

/// Issue an Execute call and print the event stream; returns the terminal
/// status.
pub async fn execute_and_stream(
    client: &mut ControllerServiceClient<Channel>,
    params: ExecuteParams,
) -> Result<EventStatus> {
    let data = serde_json::to_vec(&params)?;
    let mut stream = client
        .execute(ExecuteRequest { data })
        .await?
        .into_inner();
    let mut last = EventStatus::Running;
    while let Some(frame) = stream.message().await? {
        let event: Event = serde_json::from_slice(&frame.data)?;
        render(&event);
        last = event.status;
        if event.status.is_terminal() {
            break;
        }
    }
    Ok(last)
}

fn render(event: &Event) {
    if let Some(progress) = &event.progress {
        println!("[{:>3}%] {}", progress.completion, progress.message);
    }
    if let Some(error) = &event.error {
        eprintln!("error ({}): {}", error.kind, error.message);
    }
}
