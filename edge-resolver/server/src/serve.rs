use std::{io, net::SocketAddr, sync::Arc};

use edge_resolver_forward::{reply_with_code, Protocol};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
};
use tracing::{debug, info, instrument, warn};
use trust_dns_proto::op::{Message, ResponseCode};

use crate::{scrub, Handler, Request};

/// Serves UDP queries until shutdown, handing each datagram to the chain.
#[instrument(name = "udp", skip(socket, handler, shutdown), fields(addr = %socket.local_addr().map(|a| a.to_string()).unwrap_or_default()))]
pub async fn serve_udp(
    socket: UdpSocket,
    handler: Arc<dyn Handler>,
    shutdown: drain::Watch,
) -> io::Result<()> {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; 4096];
    info!("dns server listening");

    loop {
        let (len, src) = tokio::select! {
            received = socket.recv_from(&mut buf) => received?,
            _ = shutdown.clone().signaled() => {
                debug!("stopping udp serve loop");
                return Ok(());
            }
        };

        let message = match Message::from_vec(&buf[..len]) {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, %src, "dropping undecodable datagram");
                continue;
            }
        };

        let socket = socket.clone();
        let handler = handler.clone();
        tokio::spawn(async move {
            let response = respond(&handler, message, src, Protocol::Udp).await;
            match response.to_vec() {
                Ok(encoded) => {
                    if let Err(error) = socket.send_to(&encoded, src).await {
                        warn!(%error, %src, "failed to write udp response");
                    }
                }
                Err(error) => warn!(%error, %src, "failed to encode udp response"),
            }
        });
    }
}

/// Serves TCP queries until shutdown, one task per connection.
#[instrument(name = "tcp", skip(listener, handler, shutdown), fields(addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default()))]
pub async fn serve_tcp(
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    shutdown: drain::Watch,
) -> io::Result<()> {
    info!("dns server listening");

    loop {
        let (stream, src) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.clone().signaled() => {
                debug!("stopping tcp serve loop");
                return Ok(());
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(error) = serve_stream(stream, src, handler).await {
                debug!(%error, %src, "tcp connection closed");
            }
        });
    }
}

async fn serve_stream(
    mut stream: TcpStream,
    src: SocketAddr,
    handler: Arc<dyn Handler>,
) -> io::Result<()> {
    loop {
        let mut len = [0u8; 2];
        if stream.read_exact(&mut len).await.is_err() {
            // Clean close between queries.
            return Ok(());
        }
        let mut frame = vec![0u8; usize::from(u16::from_be_bytes(len))];
        stream.read_exact(&mut frame).await?;

        let message = match Message::from_vec(&frame) {
            Ok(message) => message,
            Err(error) => {
                debug!(%error, %src, "dropping undecodable tcp query");
                return Ok(());
            }
        };

        let response = respond(&handler, message, src, Protocol::Tcp).await;
        let encoded = response
            .to_vec()
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        stream
            .write_all(&(encoded.len() as u16).to_be_bytes())
            .await?;
        stream.write_all(&encoded).await?;
        stream.flush().await?;
    }
}

/// Runs one query through the chain; errors become ServFail replies and the
/// response is scrubbed to fit the client's transport.
async fn respond(
    handler: &Arc<dyn Handler>,
    message: Message,
    src: SocketAddr,
    proto: Protocol,
) -> Message {
    let advertised = scrub::advertised_size(&message);
    let mut request = Request {
        message,
        src,
        proto,
    };

    let mut response = match handler.handle(&mut request).await {
        Ok(response) => response,
        Err(error) => {
            warn!(%error, %src, "query failed");
            reply_with_code(&request.message, ResponseCode::ServFail)
        }
    };

    scrub::scrub(&mut response, proto, advertised);
    response
}
