//! Integration tests for command admission, flow control and timeouts,
//! running against the in-process mock server.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use redis_mux::{Client, CommandError, Reply};
use tokio::task::LocalSet;
use tokio::time::{sleep, Duration};

use common::{cmd, wait_connected, wait_until, MockRedis};

type Results = Rc<RefCell<Vec<Result<Reply, CommandError>>>>;

fn sink(results: &Results) -> impl FnMut(Result<Reply, CommandError>) + 'static {
    let results = results.clone();
    move |res| results.borrow_mut().push(res)
}

#[tokio::test(flavor = "current_thread")]
async fn get_miss_returns_nil() {
    let server = MockRedis::start().await;
    LocalSet::new()
        .run_until(async move {
            let client = Client::new();
            client.connect("127.0.0.1", server.port()).unwrap();
            wait_connected(&client).await;

            let results: Results = Rc::default();
            client
                .submit(cmd(&["get", "missing"]), sink(&results))
                .unwrap();

            wait_until(|| !results.borrow().is_empty()).await;
            assert_eq!(results.borrow()[0], Ok(Reply::Nil));
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn set_then_get_from_inside_the_continuation() {
    let server = MockRedis::start().await;
    LocalSet::new()
        .run_until(async move {
            let client = Rc::new(Client::new());
            client.connect("127.0.0.1", server.port()).unwrap();
            wait_connected(&client).await;

            let results: Results = Rc::default();
            let inner_results = results.clone();
            let inner_client = client.clone();
            client
                .submit(
                    cmd(&["set", "foo", "bar"]),
                    move |res| {
                        inner_results.borrow_mut().push(res);
                        let nested = inner_results.clone();
                        inner_client
                            .submit(cmd(&["get", "foo"]), move |res| {
                                nested.borrow_mut().push(res);
                            })
                            .unwrap();
                    },
                )
                .unwrap();

            wait_until(|| results.borrow().len() == 2).await;
            let results = results.borrow();
            assert_eq!(results[0], Ok(Reply::from("OK")));
            assert_eq!(results[1], Ok(Reply::from("bar")));
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn flow_control_throttles_and_cancel_all_clears_both_queues() {
    let server = MockRedis::start().await;
    LocalSet::new()
        .run_until(async move {
            let client = Client::new();
            client.set_max_pending(2);
            client.connect("127.0.0.1", server.port()).unwrap();
            wait_connected(&client).await;

            let results: Results = Rc::default();
            for key in ["k1", "k2", "k3", "k4"] {
                client
                    .submit(cmd(&["blpop", key, "10"]), sink(&results))
                    .unwrap();
            }
            assert_eq!(client.pending_count(), 2);
            assert_eq!(client.waiting_count(), 2);

            client.cancel_all();
            assert_eq!(client.pending_count(), 0);
            assert_eq!(client.waiting_count(), 0);

            let results = results.borrow();
            assert_eq!(results.len(), 4);
            for res in results.iter() {
                assert_eq!(res, &Err(CommandError::Skipped));
                assert_eq!(res.as_ref().unwrap_err().to_string(), "skipped");
            }
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn waiting_entries_expire_after_the_waiting_timeout() {
    let server = MockRedis::start().await;
    LocalSet::new()
        .run_until(async move {
            let client = Client::new();
            client.set_max_pending(1);
            client.set_waiting_timeout(100).unwrap();
            client.connect("127.0.0.1", server.port()).unwrap();
            wait_connected(&client).await;

            let blocked: Results = Rc::default();
            client
                .submit(cmd(&["blpop", "key", "10"]), sink(&blocked))
                .unwrap();

            let expired: Results = Rc::default();
            client.submit(cmd(&["set", "a", "1"]), sink(&expired)).unwrap();
            client.submit(cmd(&["set", "b", "2"]), sink(&expired)).unwrap();
            assert_eq!(client.waiting_count(), 2);

            sleep(Duration::from_millis(250)).await;

            let expired = expired.borrow();
            assert_eq!(expired.len(), 2);
            for res in expired.iter() {
                assert_eq!(res, &Err(CommandError::WaitingTimeout));
                assert_eq!(res.as_ref().unwrap_err().to_string(), "waiting timeout");
            }
            assert_eq!(client.waiting_count(), 0);
            assert_eq!(client.pending_count(), 1);
            assert!(blocked.borrow().is_empty());
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn replies_arrive_in_submission_order() {
    let server = MockRedis::start().await;
    LocalSet::new()
        .run_until(async move {
            let client = Client::new();
            client.connect("127.0.0.1", server.port()).unwrap();
            wait_connected(&client).await;

            let results: Results = Rc::default();
            client
                .submit(cmd(&["set", "x1", "v1"]), sink(&results))
                .unwrap();
            client
                .submit(cmd(&["set", "x2", "v2"]), sink(&results))
                .unwrap();
            client.submit(cmd(&["get", "x1"]), sink(&results)).unwrap();
            client.submit(cmd(&["get", "x2"]), sink(&results)).unwrap();

            wait_until(|| results.borrow().len() == 4).await;
            let results = results.borrow();
            assert_eq!(results[0], Ok(Reply::from("OK")));
            assert_eq!(results[1], Ok(Reply::from("OK")));
            assert_eq!(results[2], Ok(Reply::from("v1")));
            assert_eq!(results[3], Ok(Reply::from("v2")));
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn commands_submitted_while_connecting_are_sent_after_connect() {
    let server = MockRedis::start().await;
    LocalSet::new()
        .run_until(async move {
            let client = Client::new();
            client.connect("127.0.0.1", server.port()).unwrap();

            // Not connected yet: the submission is buffered, not rejected.
            let results: Results = Rc::default();
            client
                .submit(cmd(&["set", "early", "yes"]), sink(&results))
                .unwrap();
            assert_eq!(client.waiting_count(), 1);

            wait_until(|| !results.borrow().is_empty()).await;
            assert_eq!(results.borrow()[0], Ok(Reply::from("OK")));
            assert_eq!(client.waiting_count(), 0);
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn raising_max_pending_promotes_waiting_commands() {
    let server = MockRedis::start().await;
    LocalSet::new()
        .run_until(async move {
            let client = Client::new();
            client.set_max_pending(1);
            client.connect("127.0.0.1", server.port()).unwrap();
            wait_connected(&client).await;

            let blocked: Results = Rc::default();
            client
                .submit(cmd(&["blpop", "key", "10"]), sink(&blocked))
                .unwrap();
            let results: Results = Rc::default();
            client
                .submit(cmd(&["set", "later", "v"]), sink(&results))
                .unwrap();
            assert_eq!(client.waiting_count(), 1);

            client.set_max_pending(0);
            // The buffered command was promoted into the in-flight queue.
            assert_eq!(client.waiting_count(), 0);
            assert_eq!(client.pending_count(), 2);
            assert!(results.borrow().is_empty());
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn server_error_replies_carry_the_original_text() {
    let server = MockRedis::start().await;
    LocalSet::new()
        .run_until(async move {
            let client = Client::new();
            client.connect("127.0.0.1", server.port()).unwrap();
            wait_connected(&client).await;

            let results: Results = Rc::default();
            client.submit(cmd(&["bogus"]), sink(&results)).unwrap();

            wait_until(|| !results.borrow().is_empty()).await;
            let results = results.borrow();
            match &results[0] {
                Err(CommandError::Server(text)) => {
                    assert!(text.starts_with(b"ERR"));
                }
                other => panic!("expected a server error, got {other:?}"),
            }
        })
        .await;
}

#[tokio::test(flavor = "current_thread")]
async fn cancel_all_is_safe_from_inside_a_continuation() {
    let server = MockRedis::start().await;
    LocalSet::new()
        .run_until(async move {
            let client = Rc::new(Client::new());
            client.connect("127.0.0.1", server.port()).unwrap();
            wait_connected(&client).await;

            let canceller = client.clone();
            let results: Results = Rc::default();
            let seen = results.clone();
            client
                .submit(cmd(&["ping"]), move |res| {
                    seen.borrow_mut().push(res);
                    canceller.cancel_all();
                })
                .unwrap();

            let blocked: Results = Rc::default();
            client
                .submit(cmd(&["blpop", "key", "10"]), sink(&blocked))
                .unwrap();

            wait_until(|| !results.borrow().is_empty()).await;
            assert_eq!(results.borrow()[0], Ok(Reply::from("PONG")));
            // The blocked entry was cancelled from inside the continuation.
            assert_eq!(blocked.borrow().len(), 1);
            assert_eq!(blocked.borrow()[0], Err(CommandError::Skipped));
            assert_eq!(client.pending_count(), 0);
            assert_eq!(client.waiting_count(), 0);
        })
        .await;
}
