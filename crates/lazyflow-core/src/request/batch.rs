//! Fan-out helper: submit many requests, wait for all.

use super::Request;
use crate::error::Result;
use crate::value::Value;

/// A group of requests waited on together.
///
/// All requests are submitted before the first wait so the pool can work on
/// them in parallel. The first failure cancels the requests not yet waited
/// on and is returned.
#[derive(Debug, Default)]
pub struct RequestBatch {
    requests: Vec<Request>,
}

impl RequestBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request.
    pub fn add(&mut self, request: Request) {
        self.requests.push(request);
    }

    /// Number of requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// True if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Submit every request, then wait for each in insertion order.
    pub fn wait(self) -> Result<Vec<Value>> {
        for request in &self.requests {
            request.submit();
        }
        let mut values = Vec::with_capacity(self.requests.len());
        let mut iter = self.requests.iter();
        while let Some(request) = iter.next() {
            match request.wait() {
                Ok(value) => values.push(value),
                Err(err) => {
                    for rest in iter {
                        rest.cancel();
                    }
                    return Err(err);
                }
            }
        }
        Ok(values)
    }
}

impl FromIterator<Request> for RequestBatch {
    fn from_iter<I: IntoIterator<Item = Request>>(iter: I) -> Self {
        Self {
            requests: iter.into_iter().collect(),
        }
    }
}
