//! Library half of the demo operator binary: the `Widget` CRD definition
//! and its reconciler/webhooks, exposed so `tests/e2e` can drive a real
//! `Widget` against a live cluster without duplicating the CRD type.

pub mod widget;
