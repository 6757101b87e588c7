use std::{
    convert::Infallible,
    net::SocketAddr,
    pin::Pin,
    sync::{atomic::{AtomicU32, Ordering}, Arc},
    task::{ready, Context, Poll},
};
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{
    header::{HeaderValue, CONTENT_TYPE, COOKIE, SET_COOKIE},
    service::service_fn,
    Method, Request, Response, StatusCode,
};
use hyper_util::{rt::{TokioExecutor, TokioIo}, server::conn::auto};
use pin_project_lite::pin_project;
use tokio::{io::{AsyncRead, AsyncWrite}, net::TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};
use crate::{error::BoxError, server::Wire};
use super::{
    errors::TransportError,
    long_polling::{ExpirationHook, LongPollingTransport, Reply},
    ConnectionID,
};

/// http entry point of the long-polling transport
#[derive(Clone)]
pub struct Proxy {
    transport: Arc<LongPollingTransport>,
    access_total: Arc<AtomicU32>,
}

impl Proxy {
    pub fn new(transport: Arc<LongPollingTransport>) -> Self {
        Self { transport, access_total: Arc::new(AtomicU32::new(1)) }
    }

    fn request_id(&self) -> ConnectionID {
        let fetch = self.access_total.fetch_add(1, Ordering::Relaxed);
        ConnectionID(fetch)
    }

    async fn serve<I>(&self, io: I, id: ConnectionID)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let proxy = self.clone();
        let service = service_fn(move |req| {
            let proxy = proxy.clone();
            async move { Ok::<_, Infallible>(proxy.handle(req).await) }
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        if let Err(err) = builder.serve_connection(TokioIo::new(io), service).await {
            debug!(connection = %id, "[http] connection closed: {}", err);
        }
    }

    /// answers one bayeux POST
    pub async fn handle<B>(&self, req: Request<B>) -> Response<FinishBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<BoxError>,
    {
        if req.method() != Method::POST {
            debug!(method = %req.method(), "[http] rejected method");
            return status_response(StatusCode::BAD_REQUEST);
        }

        let options = self.transport.options();
        let browser_id = browser_id(&req, &options.browser_cookie_name);
        let outcome = match read_body(req.into_body(), options.max_body_size).await {
            Ok(body) => self.transport.handle(browser_id.as_deref(), &body).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(reply) => self.respond(reply),
            Err(err) => {
                let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                debug!(%status, "[http] request failed: {}", err);
                status_response(status)
            }
        }
    }

    fn respond(&self, reply: Reply) -> Response<FinishBody> {
        let mut response = Response::new(FinishBody::new(reply.body, reply.expiration));
        response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(browser_id) = reply.browser_id {
            let cookie = self.transport.browser_cookie(&browser_id);
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    response.headers_mut().insert(SET_COOKIE, value);
                },
                Err(err) => warn!("[http] invalid browser cookie: {}", err),
            }
        }
        response
    }
}

impl Wire for Proxy {
    async fn accept(&self, stream: TcpStream, peer: SocketAddr, tls: Option<TlsAcceptor>) {
        let id = self.request_id();
        let proxy = self.clone();
        debug!(connection = %id, %peer, "[stream] process");

        tokio::spawn(async move {
            let Some(tls) = tls else {
                return proxy.serve(stream, id).await;
            };
            match tls.accept(stream).await {
                Ok(stream) => {
                    debug!(connection = %id, "[stream] secured");
                    proxy.serve(stream, id).await;
                },
                Err(err) => warn!(connection = %id, "[tls] error: {}", err),
            }
        });
    }
}

pin_project! {
    /// response body that lets go of the expiration hook once the last
    /// frame is polled, or when the response is dropped unsent
    pub struct FinishBody {
        #[pin]
        inner: Full<Bytes>,
        hook: Option<ExpirationHook>,
    }
}

impl FinishBody {
    fn new(body: Bytes, hook: Option<ExpirationHook>) -> Self {
        Self { inner: Full::new(body), hook }
    }

    fn empty() -> Self {
        Self::new(Bytes::new(), None)
    }
}

impl Body for FinishBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));
        if frame.is_none() {
            this.hook.take();
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn status_response(status: StatusCode) -> Response<FinishBody> {
    let mut response = Response::new(FinishBody::empty());
    *response.status_mut() = status;
    response
}

fn browser_id<B>(req: &Request<B>, cookie_name: &str) -> Option<String> {
    req.headers()
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|cookie| cookie.split_once('='))
        .find(|(name, _)| name.trim() == cookie_name)
        .map(|(_, value)| value.trim().to_string())
}

async fn read_body<B>(body: B, max_size: usize) -> Result<Bytes, TransportError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    match Limited::new(body, max_size).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => Err(TransportError::BodyTooLarge(max_size)),
        Err(err) => Err(TransportError::BodyRead(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use crate::{config::Options, message_broker::BrokerMediator};
    use super::*;

    fn proxy(options: Options) -> Proxy {
        let broker = BrokerMediator::new(&options).unwrap();
        Proxy::new(Arc::new(LongPollingTransport::new(broker, &options).unwrap()))
    }

    fn post(body: &str, cookie: Option<&str>) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().method(Method::POST).uri("/cometd");
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
    }

    async fn read(response: Response<FinishBody>) -> Vec<Value> {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn cookie_lookup() {
        struct TestCase {
            header: &'static str,
            expected: Option<&'static str>,
        }

        let test_table = [
            TestCase { header: "BAYEUX_BROWSER=abc", expected: Some("abc") },
            TestCase { header: "a=1; BAYEUX_BROWSER = abc ; b=2", expected: Some("abc") },
            TestCase { header: "a=1; b=2", expected: None },
            TestCase { header: "BAYEUX_BROWSER", expected: None },
        ];

        for case in test_table {
            let req = post("[]", Some(case.header));
            assert_eq!(browser_id(&req, "BAYEUX_BROWSER").as_deref(), case.expected, "{}", case.header);
        }
    }

    #[tokio::test]
    async fn rejected_requests() {
        struct TestCase {
            request: Request<Full<Bytes>>,
            status: StatusCode,
        }

        let get = Request::builder()
            .method(Method::GET)
            .uri("/cometd")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let test_table = [
            TestCase { request: get, status: StatusCode::BAD_REQUEST },
            TestCase { request: post("[]", None), status: StatusCode::BAD_REQUEST },
            TestCase { request: post("{\"channel\":", None), status: StatusCode::BAD_REQUEST },
            TestCase { request: post(&"[".repeat(64), None), status: StatusCode::PAYLOAD_TOO_LARGE },
        ];

        let proxy = proxy(Options::new().with("maxBodySize", 32));
        for case in test_table {
            let response = proxy.handle(case.request).await;
            assert_eq!(response.status(), case.status);
        }
    }

    #[tokio::test]
    async fn handshake_then_subscribe() {
        let proxy = proxy(Options::new());
        let response = proxy.handle(post(r#"[{"channel":"/meta/handshake"}]"#, None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let cookie = response.headers()[SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with("BAYEUX_BROWSER="));
        assert!(cookie.ends_with("; HttpOnly"));
        let browser = cookie.split(';').next().unwrap().to_string();

        let body = read(response).await;
        let client_id = body[0]["clientId"].as_str().unwrap().to_string();
        let session = proxy.transport.broker().get_session(&client_id).unwrap();
        // the body was fully written
        assert!(session.expiration_time().is_some());

        let subscribe = json!([{"channel": "/meta/subscribe", "clientId": client_id, "subscription": "/x"}]).to_string();
        let response = proxy.handle(post(&subscribe, Some(&browser))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(SET_COOKIE).is_none());
        assert_eq!(read(response).await[0]["successful"], json!(true));

        // without the browser cookie the session cannot be found
        let response = proxy.handle(post(&subscribe, None)).await;
        assert_eq!(read(response).await[0]["error"], json!("402::session_unknown"));
    }
}
