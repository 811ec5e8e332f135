//! In-process transport with scripted outcomes
#![allow(dead_code, clippy::unwrap_used)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use spoolgate_delivery::{
    DeliveryError, MailTransport, OutgoingMail, PermanentError, TransientError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Accept,
    Transient,
    Permanent,
}

impl Step {
    fn into_result(self) -> Result<(), DeliveryError> {
        match self {
            Self::Accept => Ok(()),
            Self::Transient => Err(TransientError::SmtpTemporary("451 try later".to_string()).into()),
            Self::Permanent => {
                Err(PermanentError::MessageRejected("550 no such user".to_string()).into())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct MockTransport {
    /// Consumed one per call before anything else applies
    script: Mutex<VecDeque<Step>>,
    /// Fixed outcome per subject
    by_subject: HashMap<String, Step>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delivered: Mutex<Vec<OutgoingMail>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, steps: impl IntoIterator<Item = Step>) -> Self {
        *self.script.lock().unwrap() = steps.into_iter().collect();
        self
    }

    pub fn with_subject(mut self, subject: &str, step: Step) -> Self {
        self.by_subject.insert(subject.to_string(), step);
        self
    }

    /// How long each call takes
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<OutgoingMail> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for MockTransport {
    async fn deliver(&self, mail: &OutgoingMail) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        let step = scripted
            .or_else(|| self.by_subject.get(&mail.subject).copied())
            .unwrap_or(Step::Accept);

        if step == Step::Accept {
            self.delivered.lock().unwrap().push(mail.clone());
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        step.into_result()
    }
}
