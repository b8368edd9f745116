//! Request loop run inside a renderer worker process.

use std::io::{Read, Write};

use tracing::{debug, info, warn};

use crate::control::{ControlError, MessageReader, MessageWriter, Request, Response};
use crate::error::RendererError;
use crate::renderer::Renderer;

/// Serve control requests from `input` until `SHUTDOWN` or end of stream.
///
/// Each request gets one response on `output`. The renderer is cleaned up
/// before returning. Only stream failures are returned as errors; renderer
/// errors travel back to the parent as `ERROR`/`FATAL` responses.
pub fn serve<R: Read, W: Write>(
    input: R,
    output: W,
    renderer: &Renderer,
) -> Result<(), ControlError> {
    let mut reader = MessageReader::new(input);
    let mut writer = MessageWriter::new(output);

    let result = loop {
        let request = match reader.read_request() {
            Ok(request) => request,
            Err(ControlError::ConnectionClosed) => {
                info!("control stream closed by parent");
                break Ok(());
            }
            Err(err) if err.is_recoverable() => {
                warn!(error = %err, "rejecting control request");
                if let Err(err) = writer.write_response(&Response::error(err.to_string())) {
                    break Err(err);
                }
                continue;
            }
            Err(err) => break Err(err),
        };

        let shutdown = request == Request::Shutdown;
        let response = handle(renderer, request);
        if let Err(err) = writer.write_response(&response) {
            break Err(err);
        }
        if shutdown {
            info!("worker shutting down on request");
            break Ok(());
        }
    };

    renderer.cleanup();
    result
}

fn handle(renderer: &Renderer, request: Request) -> Response {
    debug!(kind = ?request.kind(), "control request");
    let result = match request {
        Request::Init(config) => renderer.initialize(config).map(|()| Response::ok()),
        Request::ProcessCommands(buffer) => renderer
            .process_commands(&buffer)
            .and_then(|outcome| json(&outcome)),
        Request::Info => json(&renderer.get_info()),
        Request::Resize { width, height } => {
            renderer.resize(width, height).map(|()| Response::ok())
        }
        Request::Rotate(degrees) => renderer.set_rotation(degrees).map(|()| Response::ok()),
        Request::Shutdown => {
            renderer.cleanup();
            Ok(Response::ok())
        }
    };

    result.unwrap_or_else(|err| {
        if err.is_fatal() {
            Response::fatal(err.to_string())
        } else {
            Response::error(err.to_string())
        }
    })
}

fn json<T: serde::Serialize>(value: &T) -> Result<Response, RendererError> {
    Response::ok_json(value).map_err(|err| RendererError::InvalidArgument(err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::command::{encode_batch, encode_raw, Command};
    use crate::config::RendererConfig;
    use crate::control::Status;
    use crate::renderer::ProcessOutcome;
    use crate::state::RendererState;
    use bytes::{Bytes, BytesMut};

    fn exchange(requests: &[Request]) -> Vec<Response> {
        let mut input = MessageWriter::new(Vec::new());
        for request in requests {
            input.write_request(request).unwrap();
        }

        let renderer = Renderer::new();
        let mut output = Vec::new();
        serve(Cursor::new(input.into_inner()), &mut output, &renderer).unwrap();
        assert_eq!(renderer.get_state(), RendererState::Uninitialized);

        let mut reader = MessageReader::new(Cursor::new(output));
        std::iter::from_fn(|| reader.read_response().ok()).collect()
    }

    #[test]
    fn full_session() {
        let mut malformed = BytesMut::from(&encode_batch(&[Command::Flush])[..]);
        encode_raw(0x7777, 0, &[], &mut malformed);

        let responses = exchange(&[
            Request::Init(RendererConfig::stub(16, 16)),
            Request::ProcessCommands(malformed.freeze()),
            Request::Rotate(45),
            Request::Resize {
                width: 8,
                height: 8,
            },
            Request::Info,
            Request::Shutdown,
            Request::Info,
        ]);

        // Nothing after SHUTDOWN is answered.
        assert_eq!(responses.len(), 6);
        assert_eq!(responses[0].status, Status::Ok);

        let outcome: ProcessOutcome = serde_json::from_slice(&responses[1].payload).unwrap();
        assert_eq!(outcome.frame_number, Some(0));
        assert_eq!((outcome.applied, outcome.skipped), (1, 1));

        assert_eq!(responses[2].status, Status::Error);
        assert!(responses[2].message().contains("rotation"));
        assert_eq!(responses[3].status, Status::Ok);

        let info: serde_json::Value = serde_json::from_slice(&responses[4].payload).unwrap();
        assert_eq!(info["state"], "ready");
        assert_eq!(info["geometry"]["width"], 8);
        assert_eq!(responses[5].status, Status::Ok);
    }

    #[test]
    fn work_before_init_is_an_error_not_fatal() {
        let responses = exchange(&[Request::ProcessCommands(Bytes::new())]);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status, Status::Error);
    }

    #[test]
    fn failed_init_is_fatal() {
        let mut config = RendererConfig::stub(16, 16);
        config.backend = crate::config::BackendKind::Native;
        config.native.library_path = Some("/nonexistent/libfprender.so".into());
        config.native.search_paths.clear();

        let responses = exchange(&[Request::Init(config), Request::Info]);
        assert_eq!(responses[0].status, Status::Fatal);
        assert!(responses[0].message().contains("missing_driver"));

        let info: serde_json::Value = serde_json::from_slice(&responses[1].payload).unwrap();
        assert_eq!(info["state"], "error");
        assert_eq!(info["stats"]["init_failures"], 1);
    }
}
