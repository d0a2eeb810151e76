//! One connection: handshake, one instruction, one response, close.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use cfdevd_common::protocol::{
    GenericStatus, Handshake, Instruction, ProtocolError, HANDSHAKE_LEN, UNIMPLEMENTED_STATUS,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};

use crate::{alias, bind, Context};

pub(crate) async fn serve(mut stream: UnixStream, ctx: Arc<Context>) {
    match stream.peer_cred() {
        Ok(cred) => tracing::info!(
            uid = cred.uid(),
            gid = cred.gid(),
            pid = ?cred.pid(),
            "New connection received"
        ),
        Err(e) => tracing::info!("New connection received (peer credentials unavailable: {})", e),
    }

    let timeout = ctx.config.connection_timeout;
    match tokio::time::timeout(timeout, handle(&mut stream, &ctx)).await {
        Ok(Ok(instruction)) => tracing::debug!("Finished {} request", instruction),
        Ok(Err(ProtocolError::ConnectionClosed)) => {
            tracing::info!("Client disconnected before completing a request");
        }
        Ok(Err(e)) => tracing::warn!("Connection aborted: {}", e),
        Err(_) => tracing::warn!("Connection timed out after {:?}", timeout),
    }
}

async fn handle(stream: &mut UnixStream, ctx: &Context) -> Result<Instruction, ProtocolError> {
    handshake(stream, ctx).await?;

    let mut code = [0u8; 1];
    stream
        .read_exact(&mut code)
        .await
        .map_err(ProtocolError::from_read)?;
    let instruction = Instruction::from(code[0]);
    tracing::info!("Received {} instruction", instruction);

    dispatch(instruction, stream, ctx).await?;
    Ok(instruction)
}

/// Writes our frame, then reads the client's. A frame that cannot be read in
/// full aborts the connection before any handler runs.
async fn handshake(stream: &mut UnixStream, ctx: &Context) -> Result<Handshake, ProtocolError> {
    let ours = Handshake::new(&ctx.config.tag);
    stream.write_all(&ours.encode()).await?;

    let mut frame = [0u8; HANDSHAKE_LEN];
    stream
        .read_exact(&mut frame)
        .await
        .map_err(ProtocolError::from_read)?;
    let theirs = Handshake::decode(&frame)?;

    if theirs.is_compatible() {
        tracing::debug!("Client handshake: {:?} v{}", theirs.tag_lossy(), theirs.version);
    } else {
        tracing::warn!(
            "Client handshake from {:?} v{} ({:?}) does not match ours",
            theirs.identifier_lossy(),
            theirs.version,
            theirs.tag_lossy()
        );
    }
    Ok(theirs)
}

async fn dispatch(
    instruction: Instruction,
    stream: &mut UnixStream,
    ctx: &Context,
) -> Result<(), ProtocolError> {
    match instruction {
        Instruction::Uninstall => uninstall(stream, ctx).await,
        Instruction::RemoveIpAlias => {
            let aliases = Arc::clone(&ctx.aliases);
            let addrs: Vec<_> = ctx.allow_list.iter().collect();
            let result = run_blocking(move || alias::remove_all(aliases.as_ref(), addrs)).await;
            write_status(stream, instruction, result).await
        }
        Instruction::AddIpAlias => {
            let aliases = Arc::clone(&ctx.aliases);
            let addrs: Vec<_> = ctx.allow_list.iter().collect();
            let result = run_blocking(move || alias::add_all(aliases.as_ref(), addrs)).await;
            write_status(stream, instruction, result).await
        }
        Instruction::Bind => bind::handle(stream, ctx).await,
        Instruction::Unknown(code) => unimplemented(stream, code).await,
    }
}

/// Drops the daemon's registration and answers. The answer goes out before
/// the daemon is asked to stop.
async fn uninstall(stream: &mut UnixStream, ctx: &Context) -> Result<(), ProtocolError> {
    let installer = Arc::clone(&ctx.installer);
    let result = run_blocking(move || installer.uninstall()).await;
    let removed = result.is_ok();

    write_status(stream, Instruction::Uninstall, result).await?;

    if removed && ctx.config.exit_on_uninstall {
        tracing::info!("Registration removed, shutting down");
        ctx.shutdown.trigger();
    }
    Ok(())
}

async fn unimplemented(stream: &mut UnixStream, code: u8) -> Result<(), ProtocolError> {
    tracing::warn!("Unimplemented instruction {} received", code);
    stream.write_all(&[UNIMPLEMENTED_STATUS]).await?;
    stream.flush().await?;
    Ok(())
}

async fn write_status(
    stream: &mut UnixStream,
    instruction: Instruction,
    result: Result<()>,
) -> Result<(), ProtocolError> {
    if let Err(e) = &result {
        tracing::error!("{} failed: {:#}", instruction, e);
    }
    let status = GenericStatus::from(result.is_ok());
    stream.write_all(&[status.to_byte()]).await?;
    stream.flush().await?;
    Ok(())
}

/// Runs a blocking collaborator call off the async executor
async fn run_blocking<F>(f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("Blocking task failed: {}", e))?
}
