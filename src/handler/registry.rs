//! Function table of a skel.
//!
//! Functions are numbered in registration order starting from 0; an
//! invocation names its target by that number. Each entry is a
//! [`TypedFunction`] that decodes the MsgPack argument list into the
//! function's parameter type, awaits the function with the shared receiver
//! and encodes whatever it returns.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use riiwire::handler::FunctionTable;
//!
//! struct Calculator;
//!
//! let mut table = FunctionTable::<Calculator>::new();
//! let add = table.add(|_calc: Arc<Calculator>, (a, b): (i64, i64)| async move { Ok(a + b) });
//! assert_eq!(add, 0);
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::AppError;
use crate::codec::MsgPackCodec;
use crate::protocol::{Fault, FaultKind};

/// What an exported function returns.
pub type CallResult<T> = std::result::Result<T, AppError>;

/// Encoded results, or the fault to send instead.
pub type Outcome = std::result::Result<Bytes, Fault>;

/// Boxed future for function outcomes.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A function the skel can invoke with raw argument bytes.
pub trait RemoteFunction<R>: Send + Sync + 'static {
    /// Run against `receiver` with a MsgPack-encoded argument list.
    fn call(&self, receiver: Arc<R>, args: &[u8]) -> BoxFuture<'static, Outcome>;
}

/// Wrapper that decodes arguments and encodes results around a typed function.
pub struct TypedFunction<F, A, T, Fut> {
    function: F,
    _phantom: PhantomData<fn(A) -> (T, Fut)>,
}

impl<F, A, T, Fut> TypedFunction<F, A, T, Fut> {
    /// Wrap a typed function.
    pub fn new(function: F) -> Self {
        Self {
            function,
            _phantom: PhantomData,
        }
    }
}

impl<R, F, A, T, Fut> RemoteFunction<R> for TypedFunction<F, A, T, Fut>
where
    R: Send + Sync + 'static,
    F: Fn(Arc<R>, A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    T: Serialize + Send + 'static,
    Fut: Future<Output = CallResult<T>> + Send + 'static,
{
    fn call(&self, receiver: Arc<R>, args: &[u8]) -> BoxFuture<'static, Outcome> {
        let parsed: A = match MsgPackCodec::decode(args) {
            Ok(v) => v,
            Err(e) => {
                let fault = Fault::new(FaultKind::BadArguments, e.to_string());
                return Box::pin(async move { Err(fault) });
            }
        };

        let fut = (self.function)(receiver, parsed);
        Box::pin(async move {
            match fut.await {
                Ok(value) => MsgPackCodec::encode(&value)
                    .map(Bytes::from)
                    .map_err(|e| Fault::new(FaultKind::Encode, e.to_string())),
                Err(err) => Err(Fault::new(FaultKind::Application, err.into_message())),
            }
        })
    }
}

/// Exported functions of one receiver, indexed by function number.
pub struct FunctionTable<R> {
    functions: Vec<Box<dyn RemoteFunction<R>>>,
}

impl<R: Send + Sync + 'static> FunctionTable<R> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
        }
    }

    /// Append a function and return its number.
    pub fn add<F, A, T, Fut>(&mut self, function: F) -> u32
    where
        F: Fn(Arc<R>, A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
        Fut: Future<Output = CallResult<T>> + Send + 'static,
    {
        self.add_raw(Box::new(TypedFunction::new(function)))
    }

    /// Append an already boxed function and return its number.
    pub fn add_raw(&mut self, function: Box<dyn RemoteFunction<R>>) -> u32 {
        let number = self.functions.len() as u32;
        self.functions.push(function);
        number
    }

    /// Look up a function by number.
    pub fn get(&self, number: u32) -> Option<&dyn RemoteFunction<R>> {
        self.functions.get(number as usize).map(|f| f.as_ref())
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Check if no function is registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Run function `number` against `receiver`.
    ///
    /// An unknown number yields a `NoSuchFunction` fault.
    pub async fn execute(&self, number: u32, receiver: Arc<R>, args: Bytes) -> Outcome {
        match self.get(number) {
            Some(function) => function.call(receiver, &args).await,
            None => Err(Fault::new(
                FaultKind::NoSuchFunction,
                format!(
                    "function {} is not registered ({} available)",
                    number,
                    self.len()
                ),
            )),
        }
    }
}

impl<R: Send + Sync + 'static> Default for FunctionTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Counter {
        total: AtomicU64,
    }

    fn encode<T: Serialize>(value: &T) -> Bytes {
        Bytes::from(MsgPackCodec::encode(value).unwrap())
    }

    fn table() -> FunctionTable<Counter> {
        let mut table = FunctionTable::new();
        table.add(|c: Arc<Counter>, (n,): (u64,)| async move {
            Ok(c.total.fetch_add(n, Ordering::SeqCst) + n)
        });
        table.add(|_c: Arc<Counter>, (a, b): (i64, i64)| async move {
            if b == 0 {
                return Err(AppError::new("divide by zero"));
            }
            Ok(a / b)
        });
        table.add(|c: Arc<Counter>, (): ()| async move { Ok(c.total.load(Ordering::SeqCst)) });
        table
    }

    #[test]
    fn test_numbering_starts_at_zero() {
        let mut table = FunctionTable::<Counter>::new();
        assert!(table.is_empty());
        assert_eq!(table.add(|_: Arc<Counter>, (): ()| async { Ok(()) }), 0);
        assert_eq!(table.add(|_: Arc<Counter>, (): ()| async { Ok(()) }), 1);
        assert_eq!(table.len(), 2);
        assert!(table.get(1).is_some());
        assert!(table.get(2).is_none());
    }

    #[tokio::test]
    async fn test_execute_shares_receiver() {
        let table = table();
        let counter = Arc::new(Counter::default());

        table.execute(0, counter.clone(), encode(&(3u64,))).await.unwrap();
        table.execute(0, counter.clone(), encode(&(4u64,))).await.unwrap();

        let results = table.execute(2, counter, encode(&())).await.unwrap();
        assert_eq!(MsgPackCodec::decode::<u64>(&results).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_application_error_becomes_fault() {
        let table = table();
        let fault = table
            .execute(1, Arc::new(Counter::default()), encode(&(1i64, 0i64)))
            .await
            .unwrap_err();

        assert_eq!(fault.kind, FaultKind::Application);
        assert_eq!(fault.message, "divide by zero");
    }

    #[tokio::test]
    async fn test_bad_arguments() {
        let table = table();
        let fault = table
            .execute(1, Arc::new(Counter::default()), encode(&("a", "b")))
            .await
            .unwrap_err();

        assert_eq!(fault.kind, FaultKind::BadArguments);
    }

    #[tokio::test]
    async fn test_unknown_function_number() {
        let table = table();
        let fault = table
            .execute(42, Arc::new(Counter::default()), encode(&()))
            .await
            .unwrap_err();

        assert_eq!(fault.kind, FaultKind::NoSuchFunction);
        assert!(fault.message.contains("42"));
    }
}
