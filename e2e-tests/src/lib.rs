//! End-to-end scenario tests for the ingress-rs workspace live in `tests/`.
