
#[cfg(test)]
mod reconnect_tests {
    use super::mock_venue::{default_reply, wait_until, MockVenue, Reply, Request};
    use rpcsession::{
        ConnectionFailure, ConnectionState, Notification, RequestPolicy, Session, SessionError,
        StaticToken, TokenSource,
    };
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    fn token() -> Option<Arc<dyn TokenSource>> {
        Some(Arc::new(StaticToken::new("test-token".to_string())))
    }

    fn error_log(session: &Session) -> Arc<Mutex<Vec<SessionError>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        session.set_error_observer(move |e: &SessionError| sink.lock().unwrap().push(e.clone()));
        errors
    }

    async fn wait_for_state(session: &Session, state: ConnectionState) -> bool {
        wait_until(Duration::from_secs(5), || session.state() == state).await
    }

    #[tokio::test]
    async fn test_reconnect_replays_subscriptions_in_add_order() {
        let venue = MockVenue::start().await;
        let session = Session::new(venue.config().with_cancel_on_disconnect(true), token()).unwrap();
        let errors = error_log(&session);
        session.connect(Duration::from_secs(5)).await.unwrap();

        for channel in ["book.C", "book.A", "book.B"] {
            session.subscribe(channel, |_: Notification| {}).await.unwrap();
        }
        let first_epoch = session.epoch();

        venue.drop_connection();
        assert!(
            wait_until(Duration::from_secs(5), || {
                venue.connections() == 2 && session.state() == ConnectionState::Ready
            })
            .await
        );
        assert!(session.epoch() > first_epoch);

        session.call("test/echo", json!({ "after": "reconnect" }), None).await.unwrap();

        let replay = venue.requests_on(1);
        let methods: Vec<&str> = replay.iter().map(|r| r.method.as_str()).collect();
        assert_eq!(
            methods,
            vec![
                "public/auth",
                "public/subscribe",
                "public/subscribe",
                "public/subscribe",
                "private/enable_cancel_on_disconnect",
                "test/echo",
            ]
        );
        let channels: Vec<&str> = replay[1..4].iter().filter_map(|r| r.channel()).collect();
        assert_eq!(channels, vec!["book.C", "book.A", "book.B"]);

        // The loss was reported exactly once
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            SessionError::ConnectionError(ConnectionFailure::Lost(_))
        ));
        drop(errors);
        session.close().await;
    }

    #[tokio::test]
    async fn test_notifications_resume_after_reconnect() {
        let venue = MockVenue::start().await;
        let session = Session::new(venue.config(), token()).unwrap();
        session.connect(Duration::from_secs(5)).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session
            .subscribe("trades.ETH", move |n: Notification| sink.lock().unwrap().push(n.data))
            .await
            .unwrap();

        venue.push("trades.ETH", json!(1));
        assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 1).await);

        venue.drop_connection();
        assert!(
            wait_until(Duration::from_secs(5), || {
                venue.connections() == 2 && session.state() == ConnectionState::Ready
            })
            .await
        );
        venue.push("trades.ETH", json!(2));
        assert!(wait_until(Duration::from_secs(2), || seen.lock().unwrap().len() == 2).await);
        assert_eq!(*seen.lock().unwrap(), vec![json!(1), json!(2)]);
        session.close().await;
    }

    #[tokio::test]
    async fn test_in_flight_calls_fail_with_connection_loss() {
        let venue = MockVenue::start().await;
        let session = Arc::new(Session::new(venue.config(), token()).unwrap());
        session.connect(Duration::from_secs(5)).await.unwrap();

        let in_flight = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .call("test/silent", json!({}), Some(Duration::from_secs(10)))
                    .await
            })
        };
        assert!(wait_until(Duration::from_secs(2), || session.pending_calls() == 1).await);

        venue.drop_connection();
        let result = in_flight.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::ConnectionError(ConnectionFailure::Lost(_)))
        ));
        session.close().await;
    }

    #[tokio::test]
    async fn test_exhausted_reconnects_close_the_session() {
        let venue = MockVenue::start().await;
        let config = venue
            .config()
            .with_reconnect(2, Duration::from_millis(10), Duration::from_millis(20));
        let session = Session::new(config, token()).unwrap();
        let errors = error_log(&session);
        session.connect(Duration::from_secs(5)).await.unwrap();

        venue.set_accepting(false);
        venue.drop_connection();
        assert!(wait_for_state(&session, ConnectionState::Closed).await);

        assert!(errors.lock().unwrap().iter().any(|e| matches!(
            e,
            SessionError::ConnectionError(ConnectionFailure::ReconnectExhausted { attempts: 2 })
        )));

        let call = session.call("test/echo", json!({}), None).await;
        assert!(matches!(
            call,
            Err(SessionError::ConnectionError(ConnectionFailure::Closed))
        ));
        let subscribe = session.subscribe("book.X", |_: Notification| {}).await;
        assert!(matches!(
            subscribe,
            Err(SessionError::ConnectionError(ConnectionFailure::Closed))
        ));
        assert!(session.connect(Duration::from_secs(1)).await.is_err());
        session.close().await;
    }

    #[tokio::test]
    async fn test_fail_fast_policy_rejects_while_reconnecting() {
        let venue = MockVenue::start().await;
        let config = venue
            .config()
            .with_reconnect(5, Duration::from_millis(500), Duration::from_secs(1));
        let session = Session::new(config, token()).unwrap();
        session.connect(Duration::from_secs(5)).await.unwrap();

        venue.drop_connection();
        assert!(wait_for_state(&session, ConnectionState::Reconnecting).await);

        let result = session.call("test/echo", json!({}), None).await;
        assert!(matches!(
            result,
            Err(SessionError::ConnectionError(ConnectionFailure::NotReady(
                ConnectionState::Reconnecting
            )))
        ));
        session.close().await;
    }

    #[tokio::test]
    async fn test_queue_policy_waits_for_ready() {
        let venue = MockVenue::start().await;
        let config = venue
            .config()
            .with_reconnect(5, Duration::from_millis(200), Duration::from_secs(1))
            .with_request_policy(RequestPolicy::Queue);
        let session = Session::new(config, token()).unwrap();
        session.connect(Duration::from_secs(5)).await.unwrap();

        venue.drop_connection();
        assert!(wait_for_state(&session, ConnectionState::Reconnecting).await);

        let result = session
            .call("test/echo", json!({ "queued": true }), Some(Duration::from_secs(3)))
            .await;
        assert_eq!(result.unwrap(), json!({ "queued": true }));
        assert!(venue.methods_on(1).iter().any(|m| m == "test/echo"));
        session.close().await;
    }

    #[tokio::test]
    async fn test_without_auto_reconnect_session_waits_for_connect() {
        let venue = MockVenue::start().await;
        let session = Session::new(venue.config().with_auto_reconnect(false), token()).unwrap();
        session.connect(Duration::from_secs(5)).await.unwrap();

        venue.drop_connection();
        assert!(wait_for_state(&session, ConnectionState::Disconnected).await);
        assert_eq!(venue.connections(), 1);

        session.connect(Duration::from_secs(5)).await.unwrap();
        assert_eq!(session.state(), ConnectionState::Ready);
        assert_eq!(venue.connections(), 2);
        session.close().await;
    }

    #[tokio::test]
    async fn test_heartbeat_detects_half_open_connection() {
        let venue = MockVenue::start().await;
        let config = venue
            .config()
            .with_auto_reconnect(false)
            .with_ping_interval(Duration::from_millis(50), Duration::from_millis(100));
        let session = Session::new(config, token()).unwrap();
        let errors = error_log(&session);
        session.connect(Duration::from_secs(5)).await.unwrap();

        venue.stall_connection();
        assert!(wait_for_state(&session, ConnectionState::Disconnected).await);
        assert!(errors.lock().unwrap().iter().any(|e| matches!(
            e,
            SessionError::ConnectionError(ConnectionFailure::PingTimeout(_))
        )));
        session.close().await;
    }

    fn reject_login_on(conn: usize) -> Arc<dyn Fn(&Request) -> Reply + Send + Sync> {
        Arc::new(move |request: &Request| {
            if request.method == "public/auth" && request.conn == conn {
                Reply::Error(13004, "invalid_credentials")
            } else {
                default_reply(request)
            }
        })
    }

    #[tokio::test]
    async fn test_auth_rejection_within_retry_limit_recovers() {
        let venue = MockVenue::with_responder(reject_login_on(1)).await;
        let session = Session::new(venue.config().with_auth_retry_limit(1), token()).unwrap();
        let errors = error_log(&session);
        session.connect(Duration::from_secs(5)).await.unwrap();

        venue.drop_connection();
        assert!(
            wait_until(Duration::from_secs(5), || {
                venue.connections() == 3 && session.state() == ConnectionState::Ready
            })
            .await
        );
        assert_eq!(venue.methods_on(1), vec!["public/auth"]);
        assert_eq!(venue.methods_on(2), vec!["public/auth"]);
        assert!(errors
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, SessionError::AuthError(_))));

        session.call("test/echo", json!({}), None).await.unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn test_auth_rejection_beyond_retry_limit_closes() {
        let venue = MockVenue::with_responder(reject_login_on(1)).await;
        let session = Session::new(venue.config().with_auth_retry_limit(0), token()).unwrap();
        session.connect(Duration::from_secs(5)).await.unwrap();

        venue.drop_connection();
        assert!(wait_for_state(&session, ConnectionState::Closed).await);
        // No further attempt after the rejection
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(venue.connections(), 2);
        session.close().await;
    }

    #[tokio::test]
    async fn test_backoff_restarts_from_base_after_ready() {
        let venue = MockVenue::start().await;
        let config = venue
            .config()
            .with_reconnect(5, Duration::from_millis(100), Duration::from_secs(2));
        let session = Session::new(config, token()).unwrap();
        session.connect(Duration::from_secs(5)).await.unwrap();

        // Two refused attempts push the schedule to 300ms
        venue.set_accepting(false);
        venue.drop_connection();
        assert!(wait_until(Duration::from_secs(5), || venue.refused() == 2).await);
        venue.set_accepting(true);
        assert!(
            wait_until(Duration::from_secs(5), || {
                venue.connections() == 2 && session.state() == ConnectionState::Ready
            })
            .await
        );

        let started = Instant::now();
        venue.drop_connection();
        assert!(
            wait_until(Duration::from_secs(5), || {
                venue.connections() == 3 && session.state() == ConnectionState::Ready
            })
            .await
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100), "recovered early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(300), "backoff not reset: {:?}", elapsed);
        session.close().await;
    }

    #[tokio::test]
    async fn test_channel_added_during_replay_is_subscribed_once() {
        let venue = MockVenue::with_responder(Arc::new(|request: &Request| {
            if request.method == "public/subscribe" && request.conn == 1 && request.channel() == Some("book.A") {
                Reply::After(Duration::from_millis(300), request.params["channels"].clone())
            } else {
                default_reply(request)
            }
        }))
        .await;
        let session = Session::new(venue.config(), token()).unwrap();
        session.connect(Duration::from_secs(5)).await.unwrap();
        session.subscribe("book.A", |_: Notification| {}).await.unwrap();

        venue.drop_connection();
        assert!(
            wait_until(Duration::from_secs(5), || {
                venue.methods_on(1).iter().any(|m| m == "public/subscribe")
            })
            .await
        );
        assert_ne!(session.state(), ConnectionState::Ready);
        session.subscribe("book.B", |_: Notification| {}).await.unwrap();

        assert!(wait_for_state(&session, ConnectionState::Ready).await);
        let subscribed_b = || {
            venue
                .requests_on(1)
                .iter()
                .filter(|r| r.method == "public/subscribe" && r.channel() == Some("book.B"))
                .count()
        };
        assert!(wait_until(Duration::from_secs(2), || subscribed_b() == 1).await);
        // Give a duplicate time to show up
        session.call("test/echo", json!({}), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(subscribed_b(), 1);
        assert_eq!(session.subscriptions(), vec!["book.A", "book.B"]);
        session.close().await;
    }
}
