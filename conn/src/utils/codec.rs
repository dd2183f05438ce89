use crate::Error;
use bytes::Bytes;
use commonware_runtime::{Sink, Stream};

/// Sends data to the sink with a 4-byte length prefix.
/// Returns an error if the message is empty, too large, or the sink is closed.
pub async fn send_frame<S: Sink>(
    sink: &mut S,
    buf: &[u8],
    max_message_size: usize,
) -> Result<(), Error> {
    // Validate frame size
    let n = buf.len();
    if n == 0 {
        return Err(Error::SendZeroSize);
    }
    if n > max_message_size {
        return Err(Error::SendTooLarge(n));
    }
    let len: u32 = n.try_into().map_err(|_| Error::SendTooLarge(n))?;

    // Send the length and the message in one write
    let mut frame = Vec::with_capacity(4 + n);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(buf);
    sink.send(frame).await.map_err(|_| Error::SendFailed)
}

/// Receives data from the stream with a 4-byte length prefix.
/// Returns an error if the message is too large or the stream is closed.
pub async fn recv_frame<T: Stream>(stream: &mut T, max_message_size: usize) -> Result<Bytes, Error> {
    // Read the first 4 bytes to get the length of the message
    let buf = stream
        .recv(vec![0u8; 4])
        .await
        .map_err(|_| Error::RecvFailed)?;
    let len: [u8; 4] = buf.as_ref().try_into().map_err(|_| Error::RecvFailed)?;

    // Validate frame size
    let len = u32::from_be_bytes(len) as usize;
    if len > max_message_size {
        return Err(Error::RecvTooLarge(len));
    }
    if len == 0 {
        return Err(Error::RecvFailed);
    }

    // Read the rest of the message
    let buf = stream
        .recv(vec![0u8; len])
        .await
        .map_err(|_| Error::RecvFailed)?;
    Ok(Bytes::copy_from_slice(buf.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_runtime::{deterministic, mocks, Runner};
    use rand::Rng;

    const MAX_MESSAGE_SIZE: usize = 1024;

    #[test]
    fn test_send_recv_at_max_message_size() {
        let executor = deterministic::Runner::default();
        executor.start(|mut context| async move {
            let (mut sink, mut stream) = mocks::Channel::init();
            let mut buf = [0u8; MAX_MESSAGE_SIZE];
            context.fill(&mut buf[..]);

            send_frame(&mut sink, &buf, MAX_MESSAGE_SIZE).await.unwrap();
            let data = recv_frame(&mut stream, MAX_MESSAGE_SIZE).await.unwrap();
            assert_eq!(data.len(), buf.len());
            assert_eq!(data, Bytes::from(buf.to_vec()));
        });
    }

    #[test]
    fn test_send_frame_layout() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (mut sink, mut stream) = mocks::Channel::init();
            let buf = b"hello";
            send_frame(&mut sink, buf, MAX_MESSAGE_SIZE).await.unwrap();

            let b = stream.recv(vec![0u8; 4]).await.unwrap();
            assert_eq!(b.as_ref(), &(buf.len() as u32).to_be_bytes()[..]);

            let b = stream.recv(vec![0u8; 5]).await.unwrap();
            assert_eq!(b.as_ref(), &buf[..]);
        });
    }

    #[test]
    fn test_send_invalid_sizes() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (mut sink, _stream) = mocks::Channel::init();
            let result = send_frame(&mut sink, &[], MAX_MESSAGE_SIZE).await;
            assert!(matches!(result, Err(Error::SendZeroSize)));

            let buf = vec![0u8; MAX_MESSAGE_SIZE + 1];
            let result = send_frame(&mut sink, &buf, MAX_MESSAGE_SIZE).await;
            assert!(matches!(result, Err(Error::SendTooLarge(n)) if n == MAX_MESSAGE_SIZE + 1));
        });
    }

    #[test]
    fn test_recv_too_large() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (mut sink, mut stream) = mocks::Channel::init();
            send_frame(&mut sink, &[1u8; 64], MAX_MESSAGE_SIZE)
                .await
                .unwrap();
            let result = recv_frame(&mut stream, 63).await;
            assert!(matches!(result, Err(Error::RecvTooLarge(64))));
        });
    }

    #[test]
    fn test_recv_zero_length() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (mut sink, mut stream) = mocks::Channel::init();
            sink.send(vec![0u8; 4]).await.unwrap();
            let result = recv_frame(&mut stream, MAX_MESSAGE_SIZE).await;
            assert!(matches!(result, Err(Error::RecvFailed)));
        });
    }
}
