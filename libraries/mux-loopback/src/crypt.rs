//! Wraps a raw [`sillad::Pipe`] in a length-prefixed, AEAD-sealed framing
//! layer keyed by a [`mux_cipher::BlockCipher`], in the same
//! encrypt-then-multiplex shape `geph5-exit`/`geph5-client` use with their
//! own crypto pipes before handing the plaintext halves to
//! `picomux::PicoMux::new`. Each direction runs as its own background
//! task connected to the caller through a `bipe` channel, the same plumbing
//! `picomux::Stream` itself is built from.

use bipe::{BipeReader, BipeWriter};
use futures_util::{AsyncReadExt, AsyncWriteExt};
use mux_cipher::BlockCipher;
use sillad::Pipe;

const MAX_FRAME: usize = 16384;

/// Splits `inner` into an encrypted sender/receiver pair and returns the
/// plaintext halves a `picomux::PicoMux` can be built on top of.
pub fn encrypt_pipe<P: Pipe>(inner: P, cipher: BlockCipher) -> (BipeReader, BipeWriter) {
    let (mut read_half, mut write_half) = futures_util::io::split(inner);
    let (mut write_incoming, read_incoming) = bipe::bipe(65536);
    let (write_outgoing, mut read_outgoing) = bipe::bipe(65536);

    {
        let cipher = cipher.clone();
        smolscale::spawn(async move {
            let mut counter = 0u64;
            let mut buf = vec![0u8; MAX_FRAME];
            loop {
                let n = match read_outgoing.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let sealed = cipher.seal(counter, &buf[..n]);
                counter += 1;
                let len = (sealed.len() as u32).to_le_bytes();
                if write_half.write_all(&len).await.is_err() {
                    break;
                }
                if write_half.write_all(&sealed).await.is_err() {
                    break;
                }
            }
            let _ = write_half.close().await;
        })
        .detach();
    }

    smolscale::spawn(async move {
        let mut counter = 0u64;
        loop {
            let mut len_buf = [0u8; 4];
            if read_half.read_exact(&mut len_buf).await.is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_FRAME + 16 {
                tracing::debug!(len, "oversized encrypted frame, dropping connection");
                break;
            }
            let mut sealed = vec![0u8; len];
            if read_half.read_exact(&mut sealed).await.is_err() {
                break;
            }
            let plain = match cipher.open(counter, &sealed) {
                Ok(p) => p,
                Err(err) => {
                    tracing::debug!(?err, "failed to open encrypted frame");
                    break;
                }
            };
            counter += 1;
            if write_incoming.write_all(&plain).await.is_err() {
                break;
            }
        }
    })
    .detach();

    (read_incoming, write_outgoing)
}
