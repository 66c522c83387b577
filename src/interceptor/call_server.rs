//! The last stage: drive one request/response over the exchange.

use http::{header::CONNECTION, Method, StatusCode};

use super::{Chain, Interceptor};
use crate::{
    error::Error,
    request::permits_request_body,
    response::{Response, ResponseBody},
    transport::ResponseHead,
    util::now_millis,
};

pub(crate) struct CallServerInterceptor;

impl Interceptor for CallServerInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> crate::Result<Response> {
        let exchange = chain
            .exchange()
            .expect("the connect stage runs before the call-server stage")
            .clone();
        let request = chain.request().clone();
        let sent_at = now_millis();

        // Last cancellation gate before bytes leave the client.
        if chain.call_inner().is_canceled() {
            exchange.cancel();
            return Err(Error::canceled());
        }

        exchange.write_request_headers(&request)?;

        let mut early_head: Option<ResponseHead> = None;
        if permits_request_body(request.method()) && request.body().is_some() {
            let body = request.body().expect("checked above").clone();

            // For `Expect: 100-continue`, hold the body until the server
            // invites it. An early final response means the body is never
            // sent.
            let expects_continue = request
                .header("expect")
                .map(|v| v.eq_ignore_ascii_case("100-continue"))
                .unwrap_or(false);
            if expects_continue {
                match exchange.read_response_headers(true)? {
                    None => exchange.write_request_body(&body)?,
                    Some(head) => early_head = Some(head),
                }
            } else {
                exchange.write_request_body(&body)?;
            }
        }
        exchange.finish_request()?;

        let mut head = match early_head {
            Some(head) => head,
            None => read_final_head(&exchange)?,
        };
        // Interim responses keep the exchange going.
        while head.status.as_u16() == 100 {
            head = read_final_head(&exchange)?;
        }

        let status = head.status;
        let connection_close = header_is_close(request.header(CONNECTION.as_str()))
            || header_is_close(
                head.headers
                    .get(CONNECTION)
                    .and_then(|v| v.to_str().ok()),
            );

        let mut response = Response::builder(request.clone(), status)
            .protocol(head.protocol)
            .message(head.message)
            .headers(head.headers)
            .handshake(exchange.connection().handshake().cloned())
            .sent_at_millis(sent_at)
            .received_at_millis(now_millis())
            .build();

        if request.method() == Method::HEAD || !response.promises_body() {
            exchange.no_response_body();
            response.set_body(Some(ResponseBody::empty()));
        } else {
            response.set_body(Some(crate::connection::Exchange::open_response_body(
                &exchange,
            )?));
        }

        if connection_close {
            exchange.connection().no_new_exchanges();
        }

        if (status == StatusCode::NO_CONTENT || status == StatusCode::RESET_CONTENT)
            && response.headers_content_length() > 0
        {
            return Err(Error::protocol(format!(
                "HTTP {} had non-zero Content-Length: {}",
                status.as_u16(),
                response.headers_content_length()
            )));
        }

        Ok(response)
    }
}

fn read_final_head(exchange: &crate::connection::Exchange) -> crate::Result<ResponseHead> {
    exchange
        .read_response_headers(false)?
        .ok_or_else(|| Error::protocol("codec returned no response head"))
}

fn header_is_close(value: Option<&str>) -> bool {
    value.map(|v| v.eq_ignore_ascii_case("close")).unwrap_or(false)
}
