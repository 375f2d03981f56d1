use rtcshare::ipc::{self, Framing, ReplyFrame, Request, SocketBuffer};
use serde_json::json;
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn line_request_roundtrips_through_socket_buffer() {
   let (mut client, mut server) = tokio::io::duplex(4096);
   let request = Request::service_query("array", json!({"type": "get_array_info"}), "rtcshare://data", Some("u1".into()));
   ipc::write_request(&mut client, Framing::Line, &request).await.unwrap();

   let mut buffer = SocketBuffer::new();
   let body = buffer
      .recv_request(&mut server, Framing::Line, Default::default())
      .await
      .unwrap()
      .unwrap();
   assert_eq!(Request::decode(body).unwrap(), request);
}

#[tokio::test]
async fn line_reply_keeps_newlines_in_payload() {
   let (mut server, mut client) = tokio::io::duplex(4096);
   ipc::write_reply(&mut server, Framing::Line, &json!({"success": true}), b"a\nb\n\nc")
      .await
      .unwrap();
   drop(server);

   let reply = ipc::read_reply(&mut client, Framing::Line, 1024).await.unwrap();
   assert_eq!(
      reply,
      ReplyFrame::Result { result: json!({"success": true}), payload: b"a\nb\n\nc".to_vec() }
   );
}

#[tokio::test]
async fn line_failure_is_empty_first_line() {
   let (mut server, mut client) = tokio::io::duplex(4096);
   ipc::write_failure(&mut server, Framing::Line, "malformed request: eof").await.unwrap();
   server.shutdown().await.unwrap();

   let reply = ipc::read_reply(&mut client, Framing::Line, 1024).await.unwrap();
   assert_eq!(reply, ReplyFrame::Failure("malformed request: eof".to_string()));
}

#[tokio::test]
async fn length_prefixed_reply_is_two_frames() {
   let (mut server, mut client) = tokio::io::duplex(4096);
   ipc::write_reply(&mut server, Framing::LengthPrefixed, &json!({"n": 2}), &[0, 1, 2, 10])
      .await
      .unwrap();

   let reply = ipc::read_reply(&mut client, Framing::LengthPrefixed, 1024).await.unwrap();
   assert_eq!(reply, ReplyFrame::Result { result: json!({"n": 2}), payload: vec![0, 1, 2, 10] });
}

#[tokio::test]
async fn length_prefixed_failure_has_empty_head_frame() {
   let (mut server, mut client) = tokio::io::duplex(4096);
   ipc::write_failure(&mut server, Framing::LengthPrefixed, "bad").await.unwrap();

   let reply = ipc::read_reply(&mut client, Framing::LengthPrefixed, 1024).await.unwrap();
   assert_eq!(reply, ReplyFrame::Failure("bad".to_string()));
}

#[tokio::test]
async fn length_prefixed_request_roundtrip() {
   let (mut client, mut server) = tokio::io::duplex(4096);
   let request = Request::service_query("test", json!([1, 2, 3]), "", None);
   ipc::write_request(&mut client, Framing::LengthPrefixed, &request).await.unwrap();

   let mut buffer = SocketBuffer::new();
   let body = buffer
      .recv_request(&mut server, Framing::LengthPrefixed, Default::default())
      .await
      .unwrap()
      .unwrap();
   assert_eq!(Request::decode(body).unwrap(), request);
}
