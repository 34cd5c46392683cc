use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use uptime_stack::{Request, Response, StackService};

async fn function_handler(event: LambdaEvent<Request>) -> Result<Response, Error> {
    let service = StackService::new().await?;
    service.handle_request(event.payload).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    run(service_fn(function_handler)).await
}
