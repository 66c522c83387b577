//! Turns a request into a live exchange by borrowing or building a healthy
//! connection.

use super::{Chain, Interceptor};
use crate::response::Response;

pub(crate) struct ConnectInterceptor;

impl Interceptor for ConnectInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> crate::Result<Response> {
        let request = chain.request().clone();
        let exchange = chain.call_inner().init_exchange(&request)?;
        chain.set_exchange(exchange);
        chain.proceed(request)
    }
}
