use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};

use codepod::config::Settings;
use codepod::kv::{KvStore, RedisStore};

pub async fn run() -> anyhow::Result<()> {
    println!("Running codepod connectivity checks...\n");

    // 1. Configuration
    print!("  Configuration ............... ");
    let settings = match Settings::from_env() {
        Ok(s) => {
            println!("OK");
            s
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("{}", e);
        }
    };

    // 2. Redis
    print!("  Redis ....................... ");
    match RedisStore::connect(&settings.redis_url).await {
        Ok(store) => match store.ping().await {
            Ok(()) => println!("OK ({})", settings.redis_url),
            Err(e) => println!("FAIL ({})", e),
        },
        Err(e) => println!("FAIL ({})", e),
    }

    // 3. Kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    // 4. Cluster connectivity
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    }

    // 5. Pod permissions in the execution namespace
    print!("  Pod permissions ............. ");
    let pods: Api<Pod> = Api::namespaced(client.clone(), &settings.namespace);
    match pods.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK (namespace '{}')", settings.namespace),
        Err(e) => println!("FAIL ({})", e),
    }

    // 6. Pool configuration summary
    print!("  Pool configuration .......... ");
    let pooled = settings.pooled_languages();
    if settings.pod_pool_enabled && !pooled.is_empty() {
        println!("OK (warm pools: {:?})", pooled);
    } else {
        println!("OK (on-demand only)");
    }

    println!("\nAll checks completed.");
    Ok(())
}
