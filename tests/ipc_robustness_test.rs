use proptest::prelude::*;
use rtcshare::{
   Error,
   error::IpcError,
   ipc::{FrameLimits, Framing, SocketBuffer},
};
use tokio::io::AsyncWriteExt;

fn limits(chunk: usize, max: usize) -> FrameLimits {
   FrameLimits { read_chunk_bytes: chunk, max_request_bytes: max }
}

#[tokio::test]
async fn test_line_accumulates_small_chunks() {
   let (mut client, mut server) = tokio::io::duplex(256);
   client.write_all(b"{\"type\":\"x\"}\n").await.unwrap();

   let mut buffer = SocketBuffer::new();
   let body = buffer
      .recv_request(&mut server, Framing::Line, limits(4, 1024))
      .await
      .unwrap()
      .unwrap();
   assert_eq!(body, b"{\"type\":\"x\"}");
}

#[tokio::test]
async fn test_line_rejects_eof_before_terminator() {
   let (mut client, mut server) = tokio::io::duplex(256);
   client.write_all(b"{\"type\":").await.unwrap();
   drop(client);

   let mut buffer = SocketBuffer::new();
   let err = buffer
      .recv_request(&mut server, Framing::Line, limits(4, 1024))
      .await
      .unwrap_err();
   assert!(matches!(err, Error::Ipc(IpcError::UnexpectedEof(8))));
}

#[tokio::test]
async fn test_line_silent_close_is_not_an_error() {
   let (client, mut server) = tokio::io::duplex(16);
   drop(client);

   let mut buffer = SocketBuffer::new();
   let body = buffer
      .recv_request(&mut server, Framing::Line, limits(4, 1024))
      .await
      .unwrap();
   assert!(body.is_none());
}

#[tokio::test]
async fn test_line_rejects_oversized_request() {
   let (mut client, mut server) = tokio::io::duplex(4096);
   client.write_all(&[b'a'; 200]).await.unwrap();

   let mut buffer = SocketBuffer::new();
   let err = buffer
      .recv_request(&mut server, Framing::Line, limits(16, 64))
      .await
      .unwrap_err();
   assert!(err.to_string().contains("message too large"));
}

#[tokio::test]
async fn test_length_prefixed_rejects_truncated_payload() {
   let (mut client, mut server) = tokio::io::duplex(32);
   client.write_all(&10u32.to_le_bytes()).await.unwrap();
   client.write_all(&[0xaa; 5]).await.unwrap();
   drop(client);

   let mut buffer = SocketBuffer::new();
   let err = buffer
      .recv_request(&mut server, Framing::LengthPrefixed, limits(4, 1024))
      .await
      .unwrap_err();
   assert!(matches!(err, Error::Ipc(IpcError::UnexpectedEof(9))));
}

#[tokio::test]
async fn test_length_prefixed_rejects_truncated_prefix() {
   let (mut client, mut server) = tokio::io::duplex(32);
   client.write_all(&[7, 0]).await.unwrap();
   drop(client);

   let mut buffer = SocketBuffer::new();
   let err = buffer
      .recv_request(&mut server, Framing::LengthPrefixed, limits(4, 1024))
      .await
      .unwrap_err();
   assert!(matches!(err, Error::Ipc(IpcError::UnexpectedEof(2))));
}

#[tokio::test]
async fn test_length_prefixed_silent_close_is_not_an_error() {
   let (client, mut server) = tokio::io::duplex(16);
   drop(client);

   let mut buffer = SocketBuffer::new();
   let body = buffer
      .recv_request(&mut server, Framing::LengthPrefixed, limits(4, 1024))
      .await
      .unwrap();
   assert!(body.is_none());
}

#[tokio::test]
async fn test_length_prefixed_rejects_oversized_frame() {
   let (mut client, mut server) = tokio::io::duplex(32);
   client.write_all(&2048u32.to_le_bytes()).await.unwrap();
   drop(client);

   let mut buffer = SocketBuffer::new();
   let err = buffer
      .recv_request(&mut server, Framing::LengthPrefixed, limits(4, 16))
      .await
      .unwrap_err();
   assert!(err.to_string().contains("message too large"));
}

proptest! {
   #[test]
   fn line_body_is_independent_of_chunk_size(
      body in "[a-zA-Z0-9 {}:\",]{0,300}",
      chunk in 1usize..64,
   ) {
      let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
      let received = rt.block_on(async {
         let (mut client, mut server) = tokio::io::duplex(1024);
         let mut wire = body.clone().into_bytes();
         wire.push(b'\n');
         client.write_all(&wire).await.unwrap();

         let mut buffer = SocketBuffer::new();
         buffer
            .recv_request(&mut server, Framing::Line, limits(chunk, 4096))
            .await
            .unwrap()
            .map(<[u8]>::to_vec)
      });
      prop_assert_eq!(received, Some(body.into_bytes()));
   }
}
