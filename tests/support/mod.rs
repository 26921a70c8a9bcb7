#![allow(dead_code)]

pub mod bakery_server;
pub mod socket_guard;
