#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use spoolgate_delivery::{MailTransport, OutgoingMail, SmtpConfig, SmtpTransport};
use support::mock_server::{MockSmtpServer, SmtpCommand};

fn transport_for(server: &MockSmtpServer) -> SmtpTransport {
    SmtpTransport::new(SmtpConfig {
        host: Some(server.addr().ip().to_string()),
        port: server.addr().port(),
        helo: "gate.example.com".to_string(),
        from: Some("noreply@example.com".to_string()),
        timeout_secs: 5,
    })
}

fn mail() -> OutgoingMail {
    OutgoingMail {
        to: vec!["alice@example.com".to_string()],
        cc: vec!["bob@example.com".to_string()],
        subject: "Weekly summary".to_string(),
        text_body: Some(".starts with a dot\nsecond line".to_string()),
        ..OutgoingMail::default()
    }
}

#[tokio::test]
async fn test_successful_delivery() {
    let server = MockSmtpServer::builder().build().await.unwrap();

    transport_for(&server).deliver(&mail()).await.unwrap();

    let commands = server.commands().await;
    assert_eq!(commands[0], SmtpCommand::Ehlo("gate.example.com".to_string()));
    assert_eq!(
        commands[1],
        SmtpCommand::MailFrom("FROM:<noreply@example.com>".to_string())
    );
    assert_eq!(
        commands[2],
        SmtpCommand::RcptTo("TO:<alice@example.com>".to_string())
    );
    assert_eq!(
        commands[3],
        SmtpCommand::RcptTo("TO:<bob@example.com>".to_string())
    );
    assert_eq!(commands[4], SmtpCommand::Data);
    assert_eq!(commands.last(), Some(&SmtpCommand::Quit));

    let messages = server.messages().await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("From: noreply@example.com\r\n"));
    assert!(messages[0].contains("Cc: bob@example.com\r\n"));
    assert!(messages[0].contains("Subject: Weekly summary\r\n"));
}

#[tokio::test]
async fn test_job_sender_wins_over_configured_sender() {
    let server = MockSmtpServer::builder().build().await.unwrap();

    let mail = OutgoingMail {
        from: Some("reports@example.com".to_string()),
        ..mail()
    };
    transport_for(&server).deliver(&mail).await.unwrap();

    assert!(
        server
            .commands()
            .await
            .contains(&SmtpCommand::MailFrom("FROM:<reports@example.com>".to_string()))
    );
}

#[tokio::test]
async fn test_rejected_recipient_is_permanent() {
    let server = MockSmtpServer::builder()
        .with_rcpt_to_response(550, "No such user")
        .build()
        .await
        .unwrap();

    let err = transport_for(&server).deliver(&mail()).await.unwrap_err();

    assert!(err.is_permanent());
    assert!(err.to_string().contains("550"));
    assert!(server.messages().await.is_empty());
}

#[tokio::test]
async fn test_greylisting_is_transient() {
    let server = MockSmtpServer::builder()
        .with_mail_from_response(451, "Greylisted, try again later")
        .build()
        .await
        .unwrap();

    let err = transport_for(&server).deliver(&mail()).await.unwrap_err();

    assert!(err.is_transient());
    assert!(err.to_string().contains("451"));
}

#[tokio::test]
async fn test_service_unavailable_greeting_is_transient() {
    let server = MockSmtpServer::builder()
        .with_greeting(421, "Too busy")
        .build()
        .await
        .unwrap();

    let err = transport_for(&server).deliver(&mail()).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_rejected_message_is_permanent() {
    let server = MockSmtpServer::builder()
        .with_data_end_response(554, "Message looks like spam")
        .build()
        .await
        .unwrap();

    let err = transport_for(&server).deliver(&mail()).await.unwrap_err();
    assert!(err.is_permanent());
}

#[tokio::test]
async fn test_dropped_connection_is_transient() {
    let server = MockSmtpServer::builder()
        .with_drop_after_commands(2)
        .build()
        .await
        .unwrap();

    let err = transport_for(&server).deliver(&mail()).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_helo_fallback() {
    let server = MockSmtpServer::builder()
        .with_ehlo_response(502, "Command not implemented")
        .build()
        .await
        .unwrap();

    transport_for(&server).deliver(&mail()).await.unwrap();

    let commands = server.commands().await;
    assert_eq!(commands[0], SmtpCommand::Ehlo("gate.example.com".to_string()));
    assert_eq!(commands[1], SmtpCommand::Helo("gate.example.com".to_string()));
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = SmtpTransport::new(SmtpConfig {
        host: Some("127.0.0.1".to_string()),
        port,
        from: Some("noreply@example.com".to_string()),
        ..SmtpConfig::default()
    });

    let err = transport.deliver(&mail()).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_invalid_recipient_is_rejected_before_connecting() {
    let server = MockSmtpServer::builder().build().await.unwrap();

    let mail = OutgoingMail {
        to: vec!["not-an-address".to_string()],
        ..mail()
    };
    let err = transport_for(&server).deliver(&mail).await.unwrap_err();

    assert!(err.is_permanent());
    assert!(server.commands().await.is_empty());
}
