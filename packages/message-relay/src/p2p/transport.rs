//! Line-framed TCP streams with the protocol-id handshake

use eyre::{eyre, Result, WrapErr};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

use super::{Frame, MAX_FRAME_LENGTH, PROTOCOL_ID};

pub type FramedStream = Framed<TcpStream, LinesCodec>;

fn framed(stream: TcpStream) -> FramedStream {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH))
}

/// Dial a proposer and negotiate the protocol
pub async fn connect(endpoint: &str) -> Result<FramedStream> {
    let stream = TcpStream::connect(endpoint)
        .await
        .wrap_err_with(|| format!("Failed to connect to {}", endpoint))?;
    stream.set_nodelay(true).ok();
    let mut framed = framed(stream);

    framed
        .send(PROTOCOL_ID)
        .await
        .wrap_err("Failed to send protocol id")?;
    match framed.next().await {
        Some(Ok(line)) if line.trim() == PROTOCOL_ID => Ok(framed),
        Some(Ok(line)) => Err(eyre!("peer does not speak {}: {:?}", PROTOCOL_ID, line)),
        Some(Err(e)) => Err(eyre!("handshake failed: {}", e)),
        None => Err(eyre!("peer closed the stream during handshake")),
    }
}

/// Complete the server side of the handshake on an accepted stream
pub async fn accept(stream: TcpStream) -> Result<FramedStream> {
    stream.set_nodelay(true).ok();
    let mut framed = framed(stream);
    match framed.next().await {
        Some(Ok(line)) if line.trim() == PROTOCOL_ID => {}
        Some(Ok(line)) => return Err(eyre!("unsupported protocol {:?}", line)),
        Some(Err(e)) => return Err(eyre!("handshake failed: {}", e)),
        None => return Err(eyre!("peer closed the stream during handshake")),
    }
    framed
        .send(PROTOCOL_ID)
        .await
        .wrap_err("Failed to echo protocol id")?;
    Ok(framed)
}

/// Encode and write one frame
pub async fn send_frame(stream: &mut FramedStream, frame: &Frame) -> Result<()> {
    let line = frame.encode()?;
    stream.send(line).await.wrap_err("Failed to write frame")
}
