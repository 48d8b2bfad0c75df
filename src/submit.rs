// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The client side of submission. A [SubmitContext] forwards requests to
//! whichever member currently coordinates the database and matches the
//! eventual [SubmitResponse] back to the caller by [SessionOperationId].
//! Retries reuse the id, so the coordinator can tell a retry from a new
//! operation.

use crate::{
    network::Envelope, Error, Member, MemberName, Payload, SessionOperationId, SubmitConfig,
    SubmitRequest, SubmitResponse,
};
use async_std::{future::timeout, task};
use futures::channel::oneshot;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, instrument, trace, warn};

#[derive(Clone)]
pub struct SubmitContext {
    name: MemberName,
    database: String,
    config: SubmitConfig,
    coordinator: Arc<RwLock<Option<Member>>>,
    waiting: Arc<Mutex<HashMap<SessionOperationId, oneshot::Sender<SubmitResponse>>>>,
    next_seq: Arc<AtomicU64>,
}

impl std::fmt::Debug for SubmitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("SubmitContext({:?}, {})", self.name, self.database))
    }
}

impl SubmitContext {
    pub fn new(name: MemberName, database: &str, config: SubmitConfig) -> Self {
        SubmitContext {
            name,
            database: database.to_string(),
            config,
            coordinator: Arc::new(RwLock::new(None)),
            waiting: Arc::new(Mutex::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_coordinator(&self, coordinator: Member) {
        debug!("{:?} now submits to {:?}", self.name, coordinator.name);
        *self.coordinator.write() = Some(coordinator);
    }

    pub fn coordinator(&self) -> Option<MemberName> {
        self.coordinator.read().as_ref().map(|m| m.name.clone())
    }

    pub fn next_operation_id(&self) -> SessionOperationId {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        SessionOperationId::new(self.name.clone(), seq)
    }

    /// Number of operations waiting for a response.
    pub fn pending(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Records a completion slot for `op_id` and forwards `request` to the
    /// coordinator. A slot left behind by an earlier attempt with the same id
    /// is replaced.
    pub async fn send(
        &self,
        op_id: SessionOperationId,
        request: &SubmitRequest,
    ) -> Result<oneshot::Receiver<SubmitResponse>, Error> {
        let coordinator = match self.coordinator.read().clone() {
            Some(c) => c,
            None => return Err(Error::NotCoordinator),
        };
        if !coordinator.channel.is_online().await {
            return Err(Error::NodeOffline(coordinator.name));
        }
        let payload = Payload::encode(request)?;
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(op_id.clone(), tx);
        let sent = coordinator
            .send(Envelope::SubmitRequest {
                database: self.database.clone(),
                op_id: op_id.clone(),
                payload,
            })
            .await;
        if let Err(e) = sent {
            self.waiting.lock().remove(&op_id);
            return Err(e);
        }
        Ok(rx)
    }

    /// Completes the slot for `op_id`. Returns false if nobody was waiting
    /// for it any more.
    pub fn receive(&self, op_id: &SessionOperationId, response: SubmitResponse) -> bool {
        let slot = self.waiting.lock().remove(op_id);
        match slot {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                trace!("nobody waiting for {:?}", op_id);
                false
            }
        }
    }

    /// Submits `request` under a fresh operation id and waits for its
    /// outcome, retrying transient failures. A `Failed` response comes back
    /// as the `Err` it carries.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, Error> {
        let op_id = self.next_operation_id();
        self.submit_with_id(op_id, request).await
    }

    #[instrument(skip(self, request))]
    pub async fn submit_with_id(
        &self,
        op_id: SessionOperationId,
        request: SubmitRequest,
    ) -> Result<SubmitResponse, Error> {
        let mut retries = 0;
        loop {
            let err = match self.attempt(&op_id, &request).await {
                Ok(SubmitResponse::Failed(e)) | Err(e) => e,
                Ok(response) => return Ok(response),
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if retries >= self.config.max_retries {
                warn!("giving up on {:?} after {} retries: {}", op_id, retries, err);
                return Err(err);
            }
            retries += 1;
            debug!("retrying {:?} ({}): {}", op_id, retries, err);
            task::sleep(self.config.retry_backoff()).await;
        }
    }

    async fn attempt(
        &self,
        op_id: &SessionOperationId,
        request: &SubmitRequest,
    ) -> Result<SubmitResponse, Error> {
        let rx = self.send(op_id.clone(), request).await?;
        match timeout(self.config.submit_timeout(), rx).await {
            Ok(Ok(response)) => Ok(response),
            // Only a later attempt with the same id replaces the slot.
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => {
                self.waiting.lock().remove(op_id);
                Err(Error::SubmitTimeout(op_id.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{member::testing::capture_member, DdlRequest};
    use futures::StreamExt;

    fn ddl() -> SubmitRequest {
        SubmitRequest::Ddl(DdlRequest {
            query: "create cluster 3".to_string(),
        })
    }

    fn quick(max_retries: usize) -> SubmitConfig {
        SubmitConfig {
            submit_timeout_ms: 100,
            max_retries,
            retry_backoff_ms: 1,
        }
    }

    #[test]
    fn receive_completes_send() {
        task::block_on(async {
            let _ = tracing_subscriber::fmt::try_init();
            let ctx = SubmitContext::new(MemberName::from("client"), "db", quick(0));
            let (coord, mut captured) = capture_member("n0");
            ctx.set_coordinator(coord);
            let op_id = ctx.next_operation_id();
            let rx = ctx.send(op_id.clone(), &ddl()).await.unwrap();
            match captured.drain().as_slice() {
                [Envelope::SubmitRequest { op_id: sent, .. }] => assert_eq!(*sent, op_id),
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(ctx.pending(), 1);
            assert!(ctx.receive(&op_id, SubmitResponse::Ddl("ok".into())));
            assert_eq!(rx.await.unwrap(), SubmitResponse::Ddl("ok".into()));
            // Late duplicates find nobody waiting.
            assert!(!ctx.receive(&op_id, SubmitResponse::Ddl("ok".into())));
        });
    }

    #[test]
    fn offline_coordinator_is_reported() {
        task::block_on(async {
            let ctx = SubmitContext::new(MemberName::from("client"), "db", quick(1));
            assert_eq!(ctx.submit(ddl()).await, Err(Error::NotCoordinator));
            let (coord, captured) = capture_member("n0");
            captured.online.store(false, Ordering::SeqCst);
            ctx.set_coordinator(coord);
            assert_eq!(
                ctx.submit(ddl()).await,
                Err(Error::NodeOffline(MemberName::from("n0")))
            );
            assert_eq!(ctx.pending(), 0);
        });
    }

    #[test]
    fn retries_reuse_the_operation_id() {
        task::block_on(async {
            let ctx = SubmitContext::new(MemberName::from("client"), "db", quick(2));
            let (coord, mut captured) = capture_member("n0");
            ctx.set_coordinator(coord);
            let res = ctx.submit(ddl()).await;
            let ids: Vec<SessionOperationId> = captured
                .drain()
                .into_iter()
                .filter_map(|env| match env {
                    Envelope::SubmitRequest { op_id, .. } => Some(op_id),
                    _ => None,
                })
                .collect();
            assert_eq!(ids.len(), 3);
            assert!(ids.iter().all(|id| *id == ids[0]));
            assert_eq!(res, Err(Error::SubmitTimeout(ids[0].clone())));
        });
    }

    #[test]
    fn retryable_failure_is_retried() {
        task::block_on(async {
            let ctx = SubmitContext::new(MemberName::from("client"), "db", quick(3));
            let (coord, mut captured) = capture_member("n0");
            ctx.set_coordinator(coord);
            let answering = ctx.clone();
            task::spawn(async move {
                let mut n = 0;
                while let Some(env) = captured.sent.next().await {
                    if let Envelope::SubmitRequest { op_id, .. } = env {
                        n += 1;
                        let response = if n == 1 {
                            SubmitResponse::Failed(Error::LockTimeout("#9:0".into()))
                        } else {
                            SubmitResponse::Ddl("done".into())
                        };
                        answering.receive(&op_id, response);
                    }
                }
            });
            let res = ctx.submit(ddl()).await;
            assert_eq!(res, Ok(SubmitResponse::Ddl("done".into())));

            // Fatal failures come straight back.
            let fatal = SubmitContext::new(MemberName::from("c2"), "db", quick(3));
            let (coord, mut captured) = capture_member("n0");
            fatal.set_coordinator(coord);
            let answering = fatal.clone();
            task::spawn(async move {
                while let Some(env) = captured.sent.next().await {
                    if let Envelope::SubmitRequest { op_id, .. } = env {
                        let failed = SubmitResponse::Failed(Error::UnknownRequestType(7));
                        answering.receive(&op_id, failed);
                    }
                }
            });
            assert_eq!(fatal.submit(ddl()).await, Err(Error::UnknownRequestType(7)));
        });
    }
}
