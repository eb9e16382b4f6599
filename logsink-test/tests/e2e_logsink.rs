#![cfg(feature = "e2e")]

use logsink_controller_core::TlsMode;
use logsink_test::{
    await_routing, await_sink_reason, cluster_output, create, create_cluster_scoped,
    delete_cluster_sink, mk_cluster_sink, mk_sink, namespaced_output, outputs_for,
    random_suffix, syslog, webhook, with_temp_ns,
};

#[tokio::test(flavor = "current_thread")]
async fn namespaced_syslog_sink_receives_only_its_namespace() {
    with_temp_ns(|client, ns| async move {
        create(&client, mk_sink(&ns, "sink", syslog("receiver.example", 24903))).await;
        let output = namespaced_output(&ns, "sink");

        let doc = await_routing(&client, |doc| doc.outputs.contains_key(&output)).await;
        assert_eq!(outputs_for(&doc, &ns), vec![output.clone()]);
        assert!(!outputs_for(&doc, "kube-system").contains(&output));
        assert!(!outputs_for(&doc, "default").contains(&output));

        await_sink_reason(&client, &ns, "sink", "Ready").await;
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn webhook_sink_receives_only_its_namespace() {
    with_temp_ns(|client, ns| async move {
        let url = format!("https://receiver.{ns}:7070/webhook");
        create(&client, mk_sink(&ns, "hook", webhook(&url))).await;
        let output = namespaced_output(&ns, "hook");

        let doc = await_routing(&client, |doc| doc.outputs.contains_key(&output)).await;
        assert!(outputs_for(&doc, &ns).contains(&output));
        assert!(!outputs_for(&doc, "default").contains(&output));
        let descriptor = &doc.outputs[&output];
        assert!(matches!(
            descriptor.protocol,
            logsink_controller_core::Protocol::Webhook {
                tls: TlsMode::SkipVerify,
                ..
            }
        ));
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn sinks_in_two_namespaces_do_not_cross_talk() {
    with_temp_ns(|_, ns_a| async move {
        // The nested namespace is deleted even if an assertion fails.
        with_temp_ns(|client, ns_b| async move {
            create(&client, mk_sink(&ns_a, "sink", syslog("receiver.a", 24903))).await;
            create(&client, mk_sink(&ns_b, "sink", syslog("receiver.b", 24903))).await;
            let a = namespaced_output(&ns_a, "sink");
            let b = namespaced_output(&ns_b, "sink");

            let doc = await_routing(&client, |doc| {
                doc.outputs.contains_key(&a) && doc.outputs.contains_key(&b)
            })
            .await;
            let for_a = outputs_for(&doc, &ns_a);
            let for_b = outputs_for(&doc, &ns_b);
            assert!(for_a.contains(&a) && !for_a.contains(&b));
            assert!(for_b.contains(&b) && !for_b.contains(&a));
        })
        .await;
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn cluster_sink_receives_every_namespace() {
    with_temp_ns(|client, ns| async move {
        let name = format!("logsink-test-{}", random_suffix(6));
        create_cluster_scoped(&client, mk_cluster_sink(&name, syslog("receiver.cluster", 24903)))
            .await;
        let output = cluster_output(&name);

        let doc = await_routing(&client, |doc| doc.outputs.contains_key(&output)).await;
        for namespace in [ns.as_str(), "default", "not-created-yet"] {
            let outputs = outputs_for(&doc, namespace);
            assert_eq!(
                outputs.iter().filter(|o| **o == output).count(),
                1,
                "{namespace}"
            );
        }

        delete_cluster_sink(&client, &name).await;
        await_routing(&client, |doc| !doc.outputs.contains_key(&output)).await;
    })
    .await;
}

#[tokio::test(flavor = "current_thread")]
async fn invalid_sink_is_reported_and_excluded() {
    with_temp_ns(|client, ns| async move {
        create(&client, mk_sink(&ns, "bad", syslog("receiver.example", 70000))).await;
        create(&client, mk_sink(&ns, "good", syslog("receiver.example", 24903))).await;
        let good = namespaced_output(&ns, "good");

        await_sink_reason(&client, &ns, "bad", "Invalid").await;
        let doc = await_routing(&client, |doc| doc.outputs.contains_key(&good)).await;
        assert!(!doc.outputs.contains_key(&namespaced_output(&ns, "bad")));
        assert_eq!(outputs_for(&doc, &ns), vec![good]);
    })
    .await;
}
